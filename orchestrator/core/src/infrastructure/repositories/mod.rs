// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve scan state
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryScanRepository** - Scan metadata rows
//! - **InMemoryEventRepository** - Append-only accepted events, unique per fingerprint
//! - **InMemoryModuleLogRepository** - Per-module log records
//!
//! All three are `Clone` handles over shared state, so one instance can be
//! handed to the service and kept by a test for inspection.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::domain::event::{Event, EventId, Fingerprint};
use crate::domain::repository::{
    EventRecord, EventRepository, ModuleLogRecord, ModuleLogRepository, RepositoryError, ScanRepository,
};
use crate::domain::scan::{Scan, ScanId};

#[derive(Clone, Default)]
pub struct InMemoryScanRepository {
    scans: Arc<RwLock<HashMap<ScanId, Scan>>>,
}

impl InMemoryScanRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn save(&self, scan: &Scan) -> Result<(), RepositoryError> {
        self.scans.write().insert(scan.id, scan.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ScanId) -> Result<Option<Scan>, RepositoryError> {
        Ok(self.scans.read().get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Scan>, RepositoryError> {
        let mut scans: Vec<Scan> = self.scans.read().values().cloned().collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        scans.truncate(limit);
        Ok(scans)
    }

    async fn delete(&self, id: ScanId) -> Result<(), RepositoryError> {
        self.scans
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(format!("scan {}", id)))
    }
}

#[derive(Default)]
struct ScanEvents {
    records: Vec<EventRecord>,
    fingerprints: HashSet<Fingerprint>,
}

#[derive(Clone, Default)]
pub struct InMemoryEventRepository {
    scans: Arc<RwLock<HashMap<ScanId, ScanEvents>>>,
}

impl InMemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, scan_id: ScanId) -> usize {
        self.scans
            .read()
            .get(&scan_id)
            .map(|events| events.records.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn append(&self, record: EventRecord) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let events = scans.entry(record.scan_id).or_default();
        if !events.fingerprints.insert(record.event.fingerprint().clone()) {
            return Err(RepositoryError::Conflict(format!(
                "fingerprint {} already recorded for scan {}",
                record.event.fingerprint().short(),
                record.scan_id
            )));
        }
        events.records.push(record);
        Ok(())
    }

    async fn fingerprints(&self, scan_id: ScanId) -> Result<Vec<Fingerprint>, RepositoryError> {
        Ok(self
            .scans
            .read()
            .get(&scan_id)
            .map(|events| events.fingerprints.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn events(&self, scan_id: ScanId) -> Result<Vec<Event>, RepositoryError> {
        let mut events: Vec<Event> = self
            .scans
            .read()
            .get(&scan_id)
            .map(|events| events.records.iter().map(|r| r.event.clone()).collect())
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence());
        Ok(events)
    }

    async fn set_false_positive(
        &self,
        scan_id: ScanId,
        event_id: EventId,
        false_positive: bool,
    ) -> Result<(), RepositoryError> {
        let mut scans = self.scans.write();
        let record = scans
            .get_mut(&scan_id)
            .and_then(|events| events.records.iter_mut().find(|r| r.event.id() == event_id))
            .ok_or_else(|| RepositoryError::NotFound(format!("event {} in scan {}", event_id, scan_id)))?;
        record.event.set_false_positive(false_positive);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryModuleLogRepository {
    records: Arc<RwLock<Vec<ModuleLogRecord>>>,
}

impl InMemoryModuleLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleLogRepository for InMemoryModuleLogRepository {
    async fn append(&self, record: ModuleLogRecord) -> Result<(), RepositoryError> {
        self.records.write().push(record);
        Ok(())
    }

    async fn find_by_scan(
        &self,
        scan_id: ScanId,
        module: Option<&str>,
    ) -> Result<Vec<ModuleLogRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|r| r.scan_id == scan_id && module.is_none_or(|m| r.module == m))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::LogLevel;
    use crate::domain::scan::{ScanRequest, Target};

    fn root() -> Event {
        Event::root(&Target::new("DOMAIN", "example.com").unwrap())
    }

    #[tokio::test]
    async fn test_event_append_rejects_duplicate_fingerprint() {
        let repo = InMemoryEventRepository::new();
        let scan_id = ScanId::new();
        let root = root();
        let child = Event::derived("SUBDOMAIN", "www.example.com", "m", &root);
        let replay = Event::derived("SUBDOMAIN", "www.example.com", "m", &root);

        repo.append(EventRecord::new(scan_id, child)).await.unwrap();
        let err = repo.append(EventRecord::new(scan_id, replay.clone())).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Same fingerprint in another scan is independent
        repo.append(EventRecord::new(ScanId::new(), replay)).await.unwrap();
        assert_eq!(repo.fingerprints(scan_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_false_positive_flag_is_updated() {
        let repo = InMemoryEventRepository::new();
        let scan_id = ScanId::new();
        let root = root();
        let id = root.id();
        repo.append(EventRecord::new(scan_id, root)).await.unwrap();

        repo.set_false_positive(scan_id, id, true).await.unwrap();
        assert!(repo.events(scan_id).await.unwrap()[0].is_false_positive());

        let missing = repo.set_false_positive(scan_id, EventId::new(), true).await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_scan_repository_lists_recent_first() {
        let repo = InMemoryScanRepository::new();
        let target = Target::new("DOMAIN", "example.com").unwrap();
        let first = Scan::new(ScanRequest::new(target.clone(), ["a"]));
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = Scan::new(ScanRequest::new(target, ["a"]));

        repo.save(&first).await.unwrap();
        repo.save(&second).await.unwrap();

        let listed = repo.list_recent(10).await.unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(repo.list_recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_module_log_filtering() {
        let repo = InMemoryModuleLogRepository::new();
        let scan_id = ScanId::new();
        repo.append(ModuleLogRecord::new(scan_id, "a", LogLevel::Error, "boom")).await.unwrap();
        repo.append(ModuleLogRecord::new(scan_id, "b", LogLevel::Warn, "slow")).await.unwrap();
        repo.append(ModuleLogRecord::new(ScanId::new(), "a", LogLevel::Info, "other")).await.unwrap();

        assert_eq!(repo.find_by_scan(scan_id, None).await.unwrap().len(), 2);
        let only_a = repo.find_by_scan(scan_id, Some("a")).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].message, "boom");
    }
}
