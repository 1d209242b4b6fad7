// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Work items: one scheduled `(event, module)` invocation.
//!
//! Work items are created by the pipeline, consumed by the engine and never
//! mutated in between. Their lifecycle is tracked separately in [`WorkState`]:
//!
//! ```text
//! Queued ──► Running ──► Completed | Failed | TimedOut | Cancelled
//!    └──────────────────► Skipped   (module in persistent error state)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::error::ModuleError;
use crate::domain::event::Event;
use crate::domain::scan::ScanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub Uuid);

impl WorkItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    id: WorkItemId,
    scan_id: ScanId,
    event: Arc<Event>,
    module: String,
    created_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn new(scan_id: ScanId, event: Arc<Event>, module: impl Into<String>) -> Self {
        Self {
            id: WorkItemId::new(),
            scan_id,
            event,
            module: module.into(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> WorkItemId {
        self.id
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl WorkState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkState::Queued | WorkState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkState::Queued => "queued",
            WorkState::Running => "running",
            WorkState::Completed => "completed",
            WorkState::Failed => "failed",
            WorkState::TimedOut => "timed_out",
            WorkState::Cancelled => "cancelled",
            WorkState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a work item never ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Bad credentials or configuration, reported by `configure` or a handler.
    SetupFailed { message: String },
    /// Too many timeouts.
    TimeoutStrikes { strikes: u32 },
    /// Too many consecutive runtime failures.
    RepeatedFailures { failures: u32 },
    RuntimeBudgetExhausted,
    /// Scan was cancelled before the item started.
    ScanCancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::SetupFailed { message } => write!(f, "setup failed: {}", message),
            SkipReason::TimeoutStrikes { strikes } => write!(f, "{} timeouts", strikes),
            SkipReason::RepeatedFailures { failures } => write!(f, "{} consecutive failures", failures),
            SkipReason::RuntimeBudgetExhausted => write!(f, "runtime budget exhausted"),
            SkipReason::ScanCancelled => write!(f, "scan cancelled"),
        }
    }
}

impl SkipReason {
    /// Skip reason for an error that leaves the module unusable, if it is one.
    pub fn for_persistent(error: &ModuleError) -> Option<Self> {
        match error {
            ModuleError::Setup(message) => Some(SkipReason::SetupFailed {
                message: message.clone(),
            }),
            ModuleError::BudgetExhausted { .. } => Some(SkipReason::RuntimeBudgetExhausted),
            _ => None,
        }
    }
}

/// Terminal result of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkOutcome {
    Completed,
    Failed { error: String },
    TimedOut { after: Duration },
    Cancelled,
    Skipped { reason: SkipReason },
}

impl WorkOutcome {
    pub fn state(&self) -> WorkState {
        match self {
            WorkOutcome::Completed => WorkState::Completed,
            WorkOutcome::Failed { .. } => WorkState::Failed,
            WorkOutcome::TimedOut { .. } => WorkState::TimedOut,
            WorkOutcome::Cancelled => WorkState::Cancelled,
            WorkOutcome::Skipped { .. } => WorkState::Skipped,
        }
    }

    pub fn from_error(error: &ModuleError) -> Self {
        match error {
            ModuleError::Cancelled => WorkOutcome::Cancelled,
            ModuleError::Timeout(after) => WorkOutcome::TimedOut { after: *after },
            other => WorkOutcome::Failed { error: other.to_string() },
        }
    }
}

/// What the engine records once a work item reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    pub work_item_id: WorkItemId,
    pub scan_id: ScanId,
    pub module: String,
    pub event_type: String,
    pub outcome: WorkOutcome,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}
