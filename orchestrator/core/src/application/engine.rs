// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Engine
//!
//! One engine per scan. It pulls work items from the pipeline's channel and
//! runs each one inside the scan's [`SandboxManager`], bounded by the scan's
//! worker pool.
//!
//! ```text
//! work item ──► module disabled? ──yes──► Skipped
//!                   │ no
//!                   ▼
//!           acquire pool slot ──► Running ──► Completed | Failed | TimedOut | Cancelled
//! ```
//!
//! Module failures are contained: a failed or panicking handler fails only its
//! work item. A module is disabled when it reports a setup error (at configure
//! time or from a handler), exhausts its runtime budget, times out too often or
//! fails too many times in a row. Its remaining work items are then skipped
//! and each skip is recorded.
//!
//! The run loop ends when the pipeline drains (natural completion) or the
//! scan's cancellation token fires. On cancellation the engine gives running
//! handlers a bounded grace period to observe the token, then aborts them.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::pipeline::EventPipeline;
use crate::domain::config::EngineConfig;
use crate::domain::error::ModuleError;
use crate::domain::events::WorkEvent;
use crate::domain::module::{EventSink, ModuleConfig, ModuleContext, ReconModule};
use crate::domain::repository::{LogLevel, ModuleLogRecord, ModuleLogRepository};
use crate::domain::scan::{ScanId, Target};
use crate::domain::work::{SkipReason, WorkItem, WorkItemId, WorkOutcome, WorkRecord};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::sandbox::SandboxManager;
use crate::infrastructure::telemetry;

/// A configured, scan-scoped module instance.
#[derive(Clone)]
pub struct ActiveModule {
    pub module: Arc<dyn ReconModule>,
    pub config: Arc<ModuleConfig>,
}

impl fmt::Debug for ActiveModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveModule")
            .field("name", &self.module.name())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ModuleHealth {
    timeout_strikes: u32,
    consecutive_failures: u32,
    disabled: Option<SkipReason>,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
    cancelled: AtomicUsize,
    skipped: AtomicUsize,
}

/// Summary of one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// Highest number of work items running at the same time.
    pub peak_running: usize,
    /// The run ended because the scan was cancelled.
    pub interrupted: bool,
    pub disabled_modules: Vec<String>,
}

impl EngineReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.timed_out + self.cancelled + self.skipped
    }
}

pub struct ExecutionEngine {
    scan_id: ScanId,
    target: Arc<Target>,
    config: EngineConfig,
    modules: HashMap<String, ActiveModule>,
    health: DashMap<String, ModuleHealth>,
    sandbox: Arc<SandboxManager>,
    pipeline: Arc<EventPipeline>,
    logs: Arc<dyn ModuleLogRepository>,
    event_bus: EventBus,
    cancel: CancellationToken,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    counters: Counters,
    /// Work items handed to a worker and not yet recorded.
    active_items: DashMap<WorkItemId, WorkItem>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("scan_id", &self.scan_id)
            .field("modules", &self.modules.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scan_id: ScanId,
        target: Arc<Target>,
        config: EngineConfig,
        modules: HashMap<String, ActiveModule>,
        sandbox: Arc<SandboxManager>,
        pipeline: Arc<EventPipeline>,
        logs: Arc<dyn ModuleLogRepository>,
        event_bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scan_id,
            target,
            config,
            modules,
            health: DashMap::new(),
            sandbox,
            pipeline,
            logs,
            event_bus,
            cancel,
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            counters: Counters::default(),
            active_items: DashMap::new(),
        }
    }

    /// Put `module` in the skip state for the rest of the scan. Only the first
    /// reason is kept.
    pub async fn disable(&self, module: &str, reason: SkipReason) {
        {
            let mut health = self.health.entry(module.to_string()).or_default();
            if health.disabled.is_some() {
                return;
            }
            health.disabled = Some(reason.clone());
        }

        warn!(scan_id = %self.scan_id, module, reason = %reason, "Module disabled for the rest of the scan");
        self.log(module, LogLevel::Error, format!("module disabled: {}", reason)).await;
        self.event_bus.publish_work_event(WorkEvent::ModuleDisabled {
            scan_id: self.scan_id,
            module: module.to_string(),
            reason,
            disabled_at: Utc::now(),
        });
    }

    pub fn is_disabled(&self, module: &str) -> Option<SkipReason> {
        self.health.get(module).and_then(|h| h.disabled.clone())
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Drive the scan until the pipeline drains or the scan is cancelled.
    pub async fn run(self: Arc<Self>, mut work_rx: mpsc::UnboundedReceiver<WorkItem>) -> EngineReport {
        let mut workers = JoinSet::new();
        info!(scan_id = %self.scan_id, pool = self.sandbox.pool_size(), "Execution engine started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(scan_id = %self.scan_id, "Worker task panicked outside the sandbox");
                        }
                    }
                }
                item = work_rx.recv() => match item {
                    Some(item) => self.dispatch(item, &mut workers).await,
                    None => break,
                },
                _ = self.pipeline.wait_drained() => break,
            }
        }

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            self.shutdown(&mut work_rx, &mut workers).await;
        } else {
            while workers.join_next().await.is_some() {}
        }

        let mut disabled_modules: Vec<String> = self
            .health
            .iter()
            .filter(|h| h.disabled.is_some())
            .map(|h| h.key().clone())
            .collect();
        disabled_modules.sort();

        let report = EngineReport {
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
            cancelled: self.counters.cancelled.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
            peak_running: self.peak_running.load(Ordering::SeqCst),
            interrupted,
            disabled_modules,
        };
        info!(scan_id = %self.scan_id, report = ?report, "Execution engine stopped");
        report
    }

    async fn dispatch(self: &Arc<Self>, item: WorkItem, workers: &mut JoinSet<()>) {
        if let Some(reason) = self.is_disabled(item.module()) {
            self.skip(&item, reason).await;
            return;
        }

        let Some(active) = self.modules.get(item.module()).cloned() else {
            // Only resolved modules are in the index; treat anything else as unconfigured.
            let reason = SkipReason::SetupFailed {
                message: format!("module {} is not active in this scan", item.module()),
            };
            self.skip(&item, reason).await;
            return;
        };

        let limits = active.module.descriptor().limits.clone();
        if self.sandbox.budget_exhausted(item.module(), &limits) {
            self.disable(item.module(), SkipReason::RuntimeBudgetExhausted).await;
            self.skip(&item, SkipReason::RuntimeBudgetExhausted).await;
            return;
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.sandbox.acquire_slot(&limits) => permit.ok(),
        };
        let Some(permit) = permit else {
            self.skip(&item, SkipReason::ScanCancelled).await;
            return;
        };
        // The module may have been disabled while this item waited for a slot
        if let Some(reason) = self.is_disabled(item.module()) {
            drop(permit);
            self.skip(&item, reason).await;
            return;
        }

        let weight = self.sandbox.weight(&limits);
        let now_running = self.running.fetch_add(weight, Ordering::SeqCst) + weight;
        self.peak_running.fetch_max(now_running, Ordering::SeqCst);
        self.active_items.insert(item.id(), item.clone());

        let span = info_span!(
            "work_item",
            scan_id = %self.scan_id,
            module = %item.module(),
            event_type = %item.event().event_type(),
        );
        let engine = Arc::clone(self);
        workers.spawn(
            async move {
                let ctx = ModuleContext::new(
                    engine.scan_id,
                    item.module(),
                    Arc::clone(&engine.target),
                    Arc::clone(&active.config),
                    Arc::clone(&engine.pipeline) as Arc<dyn EventSink>,
                    engine.cancel.child_token(),
                );
                let report = engine
                    .sandbox
                    .execute(Arc::clone(&active.module), ctx, Arc::clone(item.event()))
                    .await;

                engine.running.fetch_sub(weight, Ordering::SeqCst);

                if let Some(exhausted) = &report.budget_exhausted {
                    debug!(module = %item.module(), error = %exhausted, "Runtime budget spent");
                    engine.disable(item.module(), SkipReason::RuntimeBudgetExhausted).await;
                }
                engine.assess(item.module(), report.error.as_ref()).await;
                drop(permit);
                if engine.active_items.remove(&item.id()).is_some() {
                    engine.record(&item, report.outcome, report.elapsed).await;
                }
                engine.pipeline.complete_work_item();
            }
            .instrument(span),
        );
    }

    async fn skip(&self, item: &WorkItem, reason: SkipReason) {
        self.record(item, WorkOutcome::Skipped { reason }, Duration::ZERO).await;
        self.pipeline.complete_work_item();
    }

    /// Update `module`'s health from one invocation result and disable it
    /// when the error is persistent or a strike limit is reached.
    async fn assess(&self, module: &str, error: Option<&ModuleError>) {
        let reason = match error {
            None => {
                if let Some(mut health) = self.health.get_mut(module) {
                    health.consecutive_failures = 0;
                }
                None
            }
            Some(ModuleError::Cancelled) => None,
            Some(e) if e.is_persistent() => SkipReason::for_persistent(e),
            Some(ModuleError::Timeout(_)) => {
                let strikes = {
                    let mut health = self.health.entry(module.to_string()).or_default();
                    health.timeout_strikes += 1;
                    health.timeout_strikes
                };
                let limit = self.config.max_timeout_strikes;
                (limit > 0 && strikes >= limit).then_some(SkipReason::TimeoutStrikes { strikes })
            }
            Some(_) => {
                let failures = {
                    let mut health = self.health.entry(module.to_string()).or_default();
                    health.consecutive_failures += 1;
                    health.consecutive_failures
                };
                let limit = self.config.max_consecutive_failures;
                (limit > 0 && failures >= limit).then_some(SkipReason::RepeatedFailures { failures })
            }
        };
        if let Some(reason) = reason {
            self.disable(module, reason).await;
        }
    }

    /// Cancellation path: skip everything still queued, give running handlers
    /// the grace period, then abort whatever is left.
    async fn shutdown(&self, work_rx: &mut mpsc::UnboundedReceiver<WorkItem>, workers: &mut JoinSet<()>) {
        self.pipeline.close();
        while let Ok(item) = work_rx.try_recv() {
            self.skip(&item, SkipReason::ScanCancelled).await;
        }

        let grace = self.config.cancel_grace();
        let joined = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if joined.is_err() {
            warn!(
                scan_id = %self.scan_id,
                remaining = workers.len(),
                grace = ?grace,
                "Handlers ignored cancellation, aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}

            let abandoned: Vec<WorkItem> = self.active_items.iter().map(|e| e.value().clone()).collect();
            for item in abandoned {
                if self.active_items.remove(&item.id()).is_some() {
                    self.record(&item, WorkOutcome::Cancelled, Duration::ZERO).await;
                }
            }
        }
        debug!(scan_id = %self.scan_id, "Engine shutdown complete");
    }

    async fn record(&self, item: &WorkItem, outcome: WorkOutcome, elapsed: Duration) {
        let counter = match &outcome {
            WorkOutcome::Completed => &self.counters.completed,
            WorkOutcome::Failed { .. } => &self.counters.failed,
            WorkOutcome::TimedOut { .. } => &self.counters.timed_out,
            WorkOutcome::Cancelled => &self.counters.cancelled,
            WorkOutcome::Skipped { .. } => &self.counters.skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        telemetry::work_item_finished(item.module(), outcome.state(), elapsed);

        match &outcome {
            WorkOutcome::Failed { error } => {
                warn!(scan_id = %self.scan_id, module = %item.module(), error = %error, "Work item failed");
                self.log(item.module(), LogLevel::Error, error.clone()).await;
            }
            WorkOutcome::TimedOut { after } => {
                self.log(item.module(), LogLevel::Warn, format!("timed out after {:?}", after))
                    .await;
            }
            _ => {
                debug!(scan_id = %self.scan_id, module = %item.module(), state = %outcome.state(), "Work item finished");
            }
        }

        let record = WorkRecord {
            work_item_id: item.id(),
            scan_id: self.scan_id,
            module: item.module().to_string(),
            event_type: item.event().event_type().to_string(),
            outcome,
            elapsed,
            finished_at: Utc::now(),
        };
        self.event_bus.publish_work_event(WorkEvent::WorkItemFinished {
            scan_id: record.scan_id,
            work_item_id: record.work_item_id,
            module: record.module,
            event_type: record.event_type,
            outcome: record.outcome,
            elapsed: record.elapsed,
            finished_at: record.finished_at,
        });
    }

    async fn log(&self, module: &str, level: LogLevel, message: String) {
        let record = ModuleLogRecord::new(self.scan_id, module, level, message);
        if let Err(e) = self.logs.append(record).await {
            error!(scan_id = %self.scan_id, module, error = %e, "Failed to persist module log record");
        }
    }
}
