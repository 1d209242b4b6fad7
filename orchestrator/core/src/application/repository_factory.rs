// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Bundles the three persistence contracts a scan service needs and creates
//! the concrete implementations. The domain layer only sees the traits.

use std::sync::Arc;

use crate::domain::repository::{EventRepository, ModuleLogRepository, ScanRepository};
use crate::infrastructure::repositories::{
    InMemoryEventRepository, InMemoryModuleLogRepository, InMemoryScanRepository,
};

#[derive(Clone)]
pub struct Repositories {
    pub scans: Arc<dyn ScanRepository>,
    pub events: Arc<dyn EventRepository>,
    pub logs: Arc<dyn ModuleLogRepository>,
}

impl Repositories {
    pub fn new(
        scans: Arc<dyn ScanRepository>,
        events: Arc<dyn EventRepository>,
        logs: Arc<dyn ModuleLogRepository>,
    ) -> Self {
        Self { scans, events, logs }
    }

    /// Process-local storage; everything is lost on exit.
    pub fn in_memory() -> Self {
        Self {
            scans: Arc::new(InMemoryScanRepository::new()),
            events: Arc::new(InMemoryEventRepository::new()),
            logs: Arc::new(InMemoryModuleLogRepository::new()),
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
