// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for scan state. Interfaces live in the domain layer
//! and are implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Stores | Implementations |
//! |-------|--------|-----------------|
//! | `ScanRepository` | `Scan` metadata row | `InMemoryScanRepository` |
//! | `EventRepository` | Append-only accepted-event stream | `InMemoryEventRepository` |
//! | `ModuleLogRepository` | Per-module error/log records | `InMemoryModuleLogRepository` |
//!
//! Event records are keyed by fingerprint and read back for two purposes only:
//! result listing and dedup bootstrap when a scan is resumed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::event::{Event, EventId, Fingerprint};
use crate::domain::scan::{Scan, ScanId};

/// Repository interface for the Scan aggregate.
#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Save scan (create or update)
    async fn save(&self, scan: &Scan) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: ScanId) -> Result<Option<Scan>, RepositoryError>;

    /// Most recently created first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Scan>, RepositoryError>;

    async fn delete(&self, id: ScanId) -> Result<(), RepositoryError>;
}

/// One persisted accepted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub scan_id: ScanId,
    pub event: Event,
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(scan_id: ScanId, event: Event) -> Self {
        Self {
            scan_id,
            event,
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only accepted-event stream.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Append an accepted event. A second record with the same fingerprint in
    /// the same scan is a `Conflict`.
    async fn append(&self, record: EventRecord) -> Result<(), RepositoryError>;

    /// Fingerprints already accepted for a scan, used for dedup bootstrap.
    async fn fingerprints(&self, scan_id: ScanId) -> Result<Vec<Fingerprint>, RepositoryError>;

    /// Accepted events in sequence order.
    async fn events(&self, scan_id: ScanId) -> Result<Vec<Event>, RepositoryError>;

    /// Flip the advisory false-positive flag on a stored event.
    async fn set_false_positive(
        &self,
        scan_id: ScanId,
        event_id: EventId,
        false_positive: bool,
    ) -> Result<(), RepositoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Per-module error/log record for a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleLogRecord {
    pub scan_id: ScanId,
    pub module: String,
    pub level: LogLevel,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

impl ModuleLogRecord {
    pub fn new(scan_id: ScanId, module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            scan_id,
            module: module.into(),
            level,
            message: message.into(),
            logged_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ModuleLogRepository: Send + Sync {
    async fn append(&self, record: ModuleLogRecord) -> Result<(), RepositoryError>;

    /// Records for a scan, optionally narrowed to one module, oldest first.
    async fn find_by_scan(
        &self,
        scan_id: ScanId,
        module: Option<&str>,
    ) -> Result<Vec<ModuleLogRecord>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
