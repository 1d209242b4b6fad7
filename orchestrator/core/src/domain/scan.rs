// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Scan Aggregate
//!
//! A [`Scan`] is one investigation of one [`Target`] by a fixed set of
//! enabled modules. Its [`ScanState`] moves through a closed transition graph:
//!
//! ```text
//! CREATED ──► STARTING ──► RUNNING ──► FINISHED
//!    │            │           ├──────► ERROR_FAILED
//!    │            │           └──────► ABORT_REQUESTED ──► ABORTED
//!    │            └─────────────────► ERROR_FAILED   (initialisation failure)
//!    └──────────────────────────────► ABORTED        (withdrawn while queued)
//! ```
//!
//! Any other move is refused with [`InvalidTransition`] and leaves the scan
//! untouched. Every accepted move is appended to the scan's history, so the
//! history is always a valid path through the graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::event::EventType;
use crate::domain::module::ModuleOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanId(pub Uuid);

impl ScanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Target value cannot be empty")]
    EmptyValue,
    #[error("Target type cannot be empty")]
    EmptyType,
    #[error("'{0}' cannot be used as a target type")]
    ReservedType(String),
}

/// Root entity under investigation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    target_type: EventType,
    value: String,
}

impl Target {
    /// Builds a normalised target. Hostnames and e-mail addresses are
    /// case-insensitive, so they are lower-cased and stripped of a trailing dot.
    pub fn new(target_type: impl Into<EventType>, value: impl AsRef<str>) -> Result<Self, TargetError> {
        let target_type = target_type.into();
        if target_type.as_str().is_empty() {
            return Err(TargetError::EmptyType);
        }
        if target_type.is_root() || target_type.is_wildcard() {
            return Err(TargetError::ReservedType(target_type.to_string()));
        }

        let trimmed = value.as_ref().trim();
        let value = match target_type.as_str() {
            "DOMAIN" | "DOMAIN_NAME" | "INTERNET_NAME" | "EMAILADDR" => {
                trimmed.trim_end_matches('.').to_ascii_lowercase()
            }
            _ => trimmed.to_string(),
        };
        if value.is_empty() {
            return Err(TargetError::EmptyValue);
        }

        Ok(Self { target_type, value })
    }

    pub fn target_type(&self) -> &EventType {
        &self.target_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.target_type, self.value)
    }
}

/// Admission priority. Declaration order is dequeue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPriority {
    High,
    Normal,
    Low,
}

impl ScanPriority {
    pub const ALL: [ScanPriority; 3] = [ScanPriority::High, ScanPriority::Normal, ScanPriority::Low];

    pub fn index(self) -> usize {
        match self {
            ScanPriority::High => 0,
            ScanPriority::Normal => 1,
            ScanPriority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanPriority::High => "high",
            ScanPriority::Normal => "normal",
            ScanPriority::Low => "low",
        }
    }
}

impl Default for ScanPriority {
    fn default() -> Self {
        ScanPriority::Normal
    }
}

impl std::str::FromStr for ScanPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(ScanPriority::High),
            "normal" => Ok(ScanPriority::Normal),
            "low" => Ok(ScanPriority::Low),
            other => Err(format!("unknown priority '{}', expected high|normal|low", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    Created,
    Starting,
    Running,
    AbortRequested,
    Aborted,
    Finished,
    ErrorFailed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Aborted | ScanState::Finished | ScanState::ErrorFailed)
    }

    pub fn can_transition_to(self, next: ScanState) -> bool {
        use ScanState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Aborted)
                | (Starting, Running)
                | (Starting, ErrorFailed)
                | (Running, Finished)
                | (Running, ErrorFailed)
                | (Running, AbortRequested)
                | (AbortRequested, Aborted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Created => "CREATED",
            ScanState::Starting => "STARTING",
            ScanState::Running => "RUNNING",
            ScanState::AbortRequested => "ABORT_REQUESTED",
            ScanState::Aborted => "ABORTED",
            ScanState::Finished => "FINISHED",
            ScanState::ErrorFailed => "ERROR_FAILED",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid scan state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ScanState,
    pub to: ScanState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub state: ScanState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Per-module options supplied with a scan request, keyed by module name.
pub type ScanOptions = BTreeMap<String, ModuleOptions>;

/// What a caller hands to the admission queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub name: Option<String>,
    pub target: Target,
    pub modules: Vec<String>,
    #[serde(default)]
    pub options: ScanOptions,
    #[serde(default)]
    pub priority: ScanPriority,
}

impl ScanRequest {
    pub fn new(target: Target, modules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: None,
            target,
            modules: modules.into_iter().map(Into::into).collect(),
            options: ScanOptions::new(),
            priority: ScanPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: ScanPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_module_options(mut self, module: impl Into<String>, options: ModuleOptions) -> Self {
        self.options.insert(module.into(), options);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub name: String,
    pub target: Target,
    pub enabled_modules: Vec<String>,
    pub options: ScanOptions,
    pub priority: ScanPriority,
    status: ScanState,
    history: Vec<StateChange>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when the scan ends in `ERROR_FAILED`.
    pub failure: Option<String>,
}

impl Scan {
    pub fn new(request: ScanRequest) -> Self {
        let created_at = Utc::now();
        let name = request
            .name
            .unwrap_or_else(|| format!("{} scan", request.target));
        Self {
            id: ScanId::new(),
            name,
            target: request.target,
            enabled_modules: request.modules,
            options: request.options,
            priority: request.priority,
            status: ScanState::Created,
            history: vec![StateChange {
                state: ScanState::Created,
                at: created_at,
                reason: None,
            }],
            created_at,
            started_at: None,
            ended_at: None,
            failure: None,
        }
    }

    pub fn status(&self) -> ScanState {
        self.status
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Validated move to `next`. On error nothing changes.
    pub fn transition(&mut self, next: ScanState, reason: Option<String>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            ScanState::Starting => self.started_at = Some(now),
            ScanState::ErrorFailed => {
                self.failure = reason.clone();
                self.ended_at = Some(now);
            }
            state if state.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }

        self.status = next;
        self.history.push(StateChange {
            state: next,
            at: now,
            reason,
        });
        Ok(())
    }

    pub fn request(&self) -> ScanRequest {
        ScanRequest {
            name: Some(self.name.clone()),
            target: self.target.clone(),
            modules: self.enabled_modules.clone(),
            options: self.options.clone(),
            priority: self.priority,
        }
    }
}
