// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Authoritative lifecycle of one scan.
//!
//! Every transition is validated against [`ScanState::can_transition_to`],
//! persisted, then published as a `ScanStateChanged` event. A rejected
//! transition leaves both the in-memory record and the repository untouched.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::events::ScanLifecycleEvent;
use crate::domain::repository::{RepositoryError, ScanRepository};
use crate::domain::scan::{InvalidTransition, Scan, ScanId, ScanState};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::telemetry;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct ScanStateMachine {
    scan: Mutex<Scan>,
    // Serializes transitions across the persist await point
    transition_lock: tokio::sync::Mutex<()>,
    repository: Arc<dyn ScanRepository>,
    event_bus: EventBus,
    state_tx: watch::Sender<ScanState>,
}

impl ScanStateMachine {
    /// Take ownership of a scan record and persist its current state.
    pub async fn new(
        scan: Scan,
        repository: Arc<dyn ScanRepository>,
        event_bus: EventBus,
    ) -> Result<Self, StateMachineError> {
        repository.save(&scan).await?;
        let (state_tx, _) = watch::channel(scan.status());
        Ok(Self {
            scan: Mutex::new(scan),
            transition_lock: tokio::sync::Mutex::new(()),
            repository,
            event_bus,
            state_tx,
        })
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan.lock().id
    }

    pub fn status(&self) -> ScanState {
        self.scan.lock().status()
    }

    pub fn snapshot(&self) -> Scan {
        self.scan.lock().clone()
    }

    pub async fn transition(&self, next: ScanState, reason: Option<String>) -> Result<(), StateMachineError> {
        let _guard = self.transition_lock.lock().await;

        let mut updated = self.scan.lock().clone();
        let from = updated.status();
        updated.transition(next, reason.clone())?;
        self.repository.save(&updated).await?;

        let scan_id = updated.id;
        let changed_at = updated
            .history()
            .last()
            .map(|change| change.at)
            .unwrap_or_else(chrono::Utc::now);
        *self.scan.lock() = updated;
        self.state_tx.send_replace(next);

        if next.is_terminal() {
            info!(scan_id = %scan_id, from = %from, to = %next, reason = ?reason, "Scan reached terminal state");
            telemetry::scan_finished(next);
        } else {
            debug!(scan_id = %scan_id, from = %from, to = %next, "Scan state changed");
            if next == ScanState::Starting {
                telemetry::scan_started();
            }
        }

        self.event_bus.publish_scan_event(ScanLifecycleEvent::ScanStateChanged {
            scan_id,
            from,
            to: next,
            reason,
            changed_at,
        });
        Ok(())
    }

    /// Move to `next` only when the current state allows it.
    pub async fn try_transition(&self, next: ScanState, reason: Option<String>) -> Result<bool, StateMachineError> {
        match self.transition(next, reason).await {
            Ok(()) => Ok(true),
            Err(StateMachineError::InvalidTransition(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    pub async fn wait_terminal(&self) -> ScanState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // Sender lives as long as self
            Err(_) => self.status(),
        };
        state
    }
}
