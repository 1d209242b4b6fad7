// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::event::{EventId, FilterReason, Fingerprint, RejectReason};
use crate::domain::scan::{ScanId, ScanPriority, ScanState};
use crate::domain::work::{SkipReason, WorkOutcome, WorkItemId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanLifecycleEvent {
    ScanQueued {
        scan_id: ScanId,
        priority: ScanPriority,
        queue_depth: usize,
        queued_at: DateTime<Utc>,
    },
    ScanStateChanged {
        scan_id: ScanId,
        from: ScanState,
        to: ScanState,
        reason: Option<String>,
        changed_at: DateTime<Utc>,
    },
    /// Emitted once per scan, right after module resolution.
    ScanResolved {
        scan_id: ScanId,
        active_modules: Vec<String>,
        excluded_modules: Vec<String>,
        warnings: Vec<String>,
        resolved_at: DateTime<Utc>,
    },
}

impl ScanLifecycleEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            ScanLifecycleEvent::ScanQueued { scan_id, .. }
            | ScanLifecycleEvent::ScanStateChanged { scan_id, .. }
            | ScanLifecycleEvent::ScanResolved { scan_id, .. } => *scan_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    EventAccepted {
        scan_id: ScanId,
        event_id: EventId,
        event_type: String,
        data: String,
        source_module: String,
        sequence: u64,
        dispatched: usize,
        filtered: Option<FilterReason>,
        accepted_at: DateTime<Utc>,
    },
    EventSuppressed {
        scan_id: ScanId,
        fingerprint: Fingerprint,
        source_module: String,
        suppressed_at: DateTime<Utc>,
    },
    EventRejected {
        scan_id: ScanId,
        event_type: String,
        source_module: String,
        reason: RejectReason,
        rejected_at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            PipelineEvent::EventAccepted { scan_id, .. }
            | PipelineEvent::EventSuppressed { scan_id, .. }
            | PipelineEvent::EventRejected { scan_id, .. } => *scan_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkEvent {
    WorkItemFinished {
        scan_id: ScanId,
        work_item_id: WorkItemId,
        module: String,
        event_type: String,
        outcome: WorkOutcome,
        elapsed: Duration,
        finished_at: DateTime<Utc>,
    },
    /// A module entered the skip state for the rest of the scan.
    ModuleDisabled {
        scan_id: ScanId,
        module: String,
        reason: SkipReason,
        disabled_at: DateTime<Utc>,
    },
}

impl WorkEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            WorkEvent::WorkItemFinished { scan_id, .. } | WorkEvent::ModuleDisabled { scan_id, .. } => *scan_id,
        }
    }
}
