// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Scan Admission Queue
//!
//! Process-wide gate in front of scan execution.
//!
//! - Three FIFO lanes (`HIGH`, `NORMAL`, `LOW`); dequeue takes the oldest scan
//!   of the highest non-empty lane.
//! - A running-scan ceiling. A slot is taken on dequeue and given back when the
//!   scan reaches a terminal state; the dequeuing side waits on that signal
//!   instead of polling.
//! - A [`BackpressureController`] that turns queue depth and slot usage into a
//!   [`PressureLevel`]:
//!
//! | Level | Condition | Effect |
//! |-------|-----------|--------|
//! | Normal | depth < `elevated_depth` and a slot is free | accepted |
//! | Elevated | depth >= `elevated_depth`, or every slot busy | accepted with warning |
//! | Critical | depth >= `critical_depth` | only `HIGH` accepted |
//! | (hard limit) | depth >= `max_queue_depth` | everything throttled |

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::domain::config::AdmissionConfig;
use crate::domain::scan::{ScanId, ScanPriority};
use crate::infrastructure::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
}

impl PressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Elevated => "elevated",
            PressureLevel::Critical => "critical",
        }
    }

    pub fn as_gauge(self) -> f64 {
        match self {
            PressureLevel::Normal => 0.0,
            PressureLevel::Elevated => 1.0,
            PressureLevel::Critical => 2.0,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps queue depth and running scans to a pressure level.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    config: AdmissionConfig,
}

impl BackpressureController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    /// Non-decreasing in `queued` for a fixed `running`.
    pub fn level(&self, queued: usize, running: usize) -> PressureLevel {
        if queued >= self.config.critical_depth {
            PressureLevel::Critical
        } else if queued >= self.config.elevated_depth || running >= self.config.max_running_scans {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    pub fn admits(&self, level: PressureLevel, priority: ScanPriority) -> bool {
        level != PressureLevel::Critical || priority == ScanPriority::High
    }
}

/// Outcome of [`AdmissionQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accepted {
        pressure: PressureLevel,
        /// Queue depth including this scan.
        queue_depth: usize,
    },
    Throttled {
        pressure: PressureLevel,
        queue_depth: usize,
    },
}

impl AdmissionDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AdmissionDecision::Accepted { .. })
    }

    pub fn pressure(&self) -> PressureLevel {
        match self {
            AdmissionDecision::Accepted { pressure, .. } | AdmissionDecision::Throttled { pressure, .. } => *pressure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedScan {
    pub scan_id: ScanId,
    pub priority: ScanPriority,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub running: usize,
    pub max_running: usize,
    pub pressure: PressureLevel,
}

impl AdmissionSnapshot {
    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_normal + self.queued_low
    }
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: [VecDeque<QueuedScan>; 3],
    running: usize,
    last_pressure: Option<PressureLevel>,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

pub struct AdmissionQueue {
    config: AdmissionConfig,
    controller: BackpressureController,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("AdmissionQueue");
        debug.field("config", &self.config);
        match self.state.try_lock() {
            Some(state) => {
                debug.field("queued", &state.depth()).field("running", &state.running);
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            controller: BackpressureController::new(config.clone()),
            config,
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
        }
    }

    /// Admit a scan into the queue or throttle it. Throttled callers retry.
    pub fn enqueue(&self, scan_id: ScanId, priority: ScanPriority) -> AdmissionDecision {
        let decision = {
            let mut state = self.state.lock();
            let depth = state.depth();
            let pressure = self.controller.level(depth, state.running);

            if depth >= self.config.max_queue_depth {
                AdmissionDecision::Throttled {
                    pressure: PressureLevel::Critical,
                    queue_depth: depth,
                }
            } else if !self.controller.admits(pressure, priority) {
                AdmissionDecision::Throttled {
                    pressure,
                    queue_depth: depth,
                }
            } else {
                state.lanes[priority.index()].push_back(QueuedScan {
                    scan_id,
                    priority,
                    enqueued_at: Utc::now(),
                });
                AdmissionDecision::Accepted {
                    pressure,
                    queue_depth: depth + 1,
                }
            }
        };

        match decision {
            AdmissionDecision::Accepted { .. } => {
                debug!(scan_id = %scan_id, priority = priority.as_str(), decision = ?decision, "Scan queued");
                self.wakeup.notify_one();
            }
            AdmissionDecision::Throttled { .. } => {
                info!(scan_id = %scan_id, priority = priority.as_str(), decision = ?decision, "Scan admission throttled");
            }
        }
        self.publish_snapshot();
        decision
    }

    /// Take a running slot for the next scan if one is free and work is queued.
    pub fn try_admit(&self) -> Option<QueuedScan> {
        let admitted = {
            let mut state = self.state.lock();
            if state.running >= self.config.max_running_scans {
                return None;
            }
            let next = state.lanes.iter_mut().find_map(VecDeque::pop_front)?;
            state.running += 1;
            next
        };
        self.publish_snapshot();
        Some(admitted)
    }

    /// Wait for a free slot and a queued scan, then admit it.
    pub async fn next_admitted(&self) -> QueuedScan {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(next) = self.try_admit() {
                return next;
            }
            notified.await;
        }
    }

    /// Give back a running slot after a scan reached a terminal state.
    pub fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
        }
        self.publish_snapshot();
        self.wakeup.notify_one();
    }

    /// Remove a scan that has not been admitted yet.
    pub fn withdraw(&self, scan_id: ScanId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            state.lanes.iter_mut().any(|lane| {
                let before = lane.len();
                lane.retain(|queued| queued.scan_id != scan_id);
                lane.len() != before
            })
        };
        if removed {
            self.publish_snapshot();
        }
        removed
    }

    pub fn pressure(&self) -> PressureLevel {
        let state = self.state.lock();
        self.controller.level(state.depth(), state.running)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.lock();
        AdmissionSnapshot {
            queued_high: state.lanes[ScanPriority::High.index()].len(),
            queued_normal: state.lanes[ScanPriority::Normal.index()].len(),
            queued_low: state.lanes[ScanPriority::Low.index()].len(),
            running: state.running,
            max_running: self.config.max_running_scans,
            pressure: self.controller.level(state.depth(), state.running),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.snapshot();
        telemetry::admission_snapshot(snapshot.queued(), snapshot.running, snapshot.pressure);

        let mut state = self.state.lock();
        if state.last_pressure != Some(snapshot.pressure) {
            if state.last_pressure.is_some() {
                info!(
                    pressure = %snapshot.pressure,
                    queued = snapshot.queued(),
                    running = snapshot.running,
                    "Admission pressure changed"
                );
            }
            state.last_pressure = Some(snapshot.pressure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max_running: usize) -> AdmissionConfig {
        AdmissionConfig {
            max_running_scans: max_running,
            elevated_depth: 2,
            critical_depth: 4,
            max_queue_depth: 6,
        }
    }

    #[test]
    fn test_pressure_is_monotonic_in_depth() {
        let controller = BackpressureController::new(config(10));
        let levels: Vec<PressureLevel> = (0..8).map(|depth| controller.level(depth, 0)).collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(levels[0], PressureLevel::Normal);
        assert_eq!(levels[2], PressureLevel::Elevated);
        assert_eq!(levels[4], PressureLevel::Critical);
    }

    #[test]
    fn test_busy_slots_raise_pressure() {
        let controller = BackpressureController::new(config(2));
        assert_eq!(controller.level(0, 1), PressureLevel::Normal);
        assert_eq!(controller.level(0, 2), PressureLevel::Elevated);
    }

    #[test]
    fn test_critical_admits_only_high() {
        let queue = AdmissionQueue::new(config(1));
        for _ in 0..4 {
            assert!(queue.enqueue(ScanId::new(), ScanPriority::Normal).is_accepted());
        }
        assert_eq!(queue.pressure(), PressureLevel::Critical);

        let low = queue.enqueue(ScanId::new(), ScanPriority::Low);
        assert_eq!(
            low,
            AdmissionDecision::Throttled {
                pressure: PressureLevel::Critical,
                queue_depth: 4
            }
        );
        assert!(queue.enqueue(ScanId::new(), ScanPriority::High).is_accepted());
        assert!(queue.enqueue(ScanId::new(), ScanPriority::High).is_accepted());

        // Hard ceiling throttles even HIGH
        assert!(!queue.enqueue(ScanId::new(), ScanPriority::High).is_accepted());
    }

    #[test]
    fn test_dequeue_order_priority_then_fifo() {
        let queue = AdmissionQueue::new(AdmissionConfig {
            max_running_scans: 10,
            elevated_depth: 10,
            critical_depth: 10,
            max_queue_depth: 10,
        });
        let low = ScanId::new();
        let normal_1 = ScanId::new();
        let normal_2 = ScanId::new();
        let high = ScanId::new();
        queue.enqueue(low, ScanPriority::Low);
        queue.enqueue(normal_1, ScanPriority::Normal);
        queue.enqueue(normal_2, ScanPriority::Normal);
        queue.enqueue(high, ScanPriority::High);

        let order: Vec<ScanId> = std::iter::from_fn(|| queue.try_admit()).map(|q| q.scan_id).collect();
        assert_eq!(order, vec![high, normal_1, normal_2, low]);
    }

    #[test]
    fn test_running_ceiling_and_release() {
        let queue = AdmissionQueue::new(config(1));
        queue.enqueue(ScanId::new(), ScanPriority::Normal);
        queue.enqueue(ScanId::new(), ScanPriority::Normal);

        assert!(queue.try_admit().is_some());
        assert!(queue.try_admit().is_none());
        queue.release_slot();
        assert!(queue.try_admit().is_some());
        assert_eq!(queue.snapshot().running, 1);
    }

    #[test]
    fn test_withdraw() {
        let queue = AdmissionQueue::new(config(1));
        let id = ScanId::new();
        queue.enqueue(id, ScanPriority::Low);
        assert!(queue.withdraw(id));
        assert!(!queue.withdraw(id));
        assert_eq!(queue.snapshot().queued(), 0);
    }

    #[tokio::test]
    async fn test_next_admitted_waits_for_slot() {
        let queue = Arc::new(AdmissionQueue::new(config(1)));
        queue.enqueue(ScanId::new(), ScanPriority::Normal);
        let second = ScanId::new();
        queue.enqueue(second, ScanPriority::Normal);

        queue.next_admitted().await;

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_admitted().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.release_slot();
        let admitted = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(admitted.scan_id, second);
    }
}
