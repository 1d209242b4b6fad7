// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Resource Sandbox
//!
//! Execution guard around one module invocation.
//!
//! - [`ResourceTracker`] is process-scoped: a global thread budget shared by
//!   every running scan, plus a per-module view of who holds it.
//! - [`SandboxManager`] is scan-scoped: it owns the scan's worker pool, the
//!   default limits and each module's cumulative runtime.
//!
//! A heavy module (`max_threads > 1`) claims all of its threads up front, both
//! from the scan pool and from the global budget, so sub-pools inside a module
//! still count against aggregate concurrency.
//!
//! Handlers run on their own task under a hard wall-clock timeout. When it
//! fires, the invocation's cancellation token is triggered and the task is
//! aborted; tool modules spawn their process with `kill_on_drop`, so aborting
//! the task also kills the process.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::domain::error::ModuleError;
use crate::domain::event::Event;
use crate::domain::module::{ModuleContext, ReconModule, ResourceLimits};
use crate::domain::work::WorkOutcome;

/// Process-wide thread budget.
pub struct ResourceTracker {
    capacity: usize,
    permits: Arc<Semaphore>,
    usage: DashMap<String, usize>,
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("modules", &self.usage.len())
            .finish()
    }
}

impl ResourceTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            usage: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Threads currently held by invocations of `module`, across all scans.
    pub fn usage(&self, module: &str) -> usize {
        self.usage.get(module).map(|v| *v).unwrap_or(0)
    }

    /// Wait for `threads` threads of global budget. Requests larger than the
    /// whole budget are capped to it.
    pub async fn claim(self: &Arc<Self>, module: &str, threads: usize) -> Result<ThreadClaim, ModuleError> {
        let threads = threads.clamp(1, self.capacity);
        let permit = self
            .permits
            .clone()
            .acquire_many_owned(threads as u32)
            .await
            .map_err(|_| ModuleError::runtime("global thread budget is closed"))?;

        *self.usage.entry(module.to_string()).or_insert(0) += threads;
        Ok(ThreadClaim {
            tracker: Arc::clone(self),
            module: module.to_string(),
            threads,
            _permit: permit,
        })
    }

    fn release(&self, module: &str, threads: usize) {
        let mut emptied = false;
        if let Some(mut held) = self.usage.get_mut(module) {
            *held = held.saturating_sub(threads);
            emptied = *held == 0;
        }
        if emptied {
            self.usage.remove_if(module, |_, held| *held == 0);
        }
    }
}

/// Global threads held by one invocation. Released on drop.
pub struct ThreadClaim {
    tracker: Arc<ResourceTracker>,
    module: String,
    threads: usize,
    _permit: OwnedSemaphorePermit,
}

impl ThreadClaim {
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for ThreadClaim {
    fn drop(&mut self) {
        self.tracker.release(&self.module, self.threads);
    }
}

/// Aborts the spawned handler if the invocation future is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct SandboxDefaults {
    pub timeout: Duration,
    pub runtime_budget: Option<Duration>,
}

/// Result of one sandboxed invocation.
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub outcome: WorkOutcome,
    pub elapsed: Duration,
    /// What the handler failed with, or the timeout the sandbox imposed.
    pub error: Option<ModuleError>,
    /// Set once the module has spent its runtime budget for this scan.
    pub budget_exhausted: Option<ModuleError>,
}

/// Scan-scoped sandbox: worker pool, default limits, runtime accounting.
pub struct SandboxManager {
    tracker: Arc<ResourceTracker>,
    pool: Arc<Semaphore>,
    pool_size: usize,
    defaults: SandboxDefaults,
    runtime: DashMap<String, Duration>,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxManager")
            .field("pool_size", &self.pool_size)
            .field("pool_available", &self.pool.available_permits())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl SandboxManager {
    pub fn new(tracker: Arc<ResourceTracker>, pool_size: usize, defaults: SandboxDefaults) -> Self {
        let pool_size = pool_size.max(1);
        Self {
            tracker,
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            defaults,
            runtime: DashMap::new(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Scan-pool slots one invocation occupies.
    pub fn weight(&self, limits: &ResourceLimits) -> usize {
        limits.max_threads.clamp(1, self.pool_size)
    }

    /// Wait for room in the scan's worker pool.
    pub async fn acquire_slot(&self, limits: &ResourceLimits) -> Result<OwnedSemaphorePermit, ModuleError> {
        self.pool
            .clone()
            .acquire_many_owned(self.weight(limits) as u32)
            .await
            .map_err(|_| ModuleError::Cancelled)
    }

    pub fn timeout_for(&self, limits: &ResourceLimits) -> Duration {
        limits.timeout.unwrap_or(self.defaults.timeout)
    }

    pub fn runtime_budget_for(&self, limits: &ResourceLimits) -> Option<Duration> {
        limits.runtime_budget.or(self.defaults.runtime_budget)
    }

    /// Handler time `module` has used in this scan.
    pub fn runtime_used(&self, module: &str) -> Duration {
        self.runtime.get(module).map(|d| *d).unwrap_or_default()
    }

    pub fn budget_exhausted(&self, module: &str, limits: &ResourceLimits) -> bool {
        self.runtime_budget_for(limits)
            .is_some_and(|budget| self.runtime_used(module) >= budget)
    }

    /// Run one `handle()` call under the module's limits.
    ///
    /// Errors and panics in the handler become a `Failed` outcome and are
    /// kept on the report; they never escape this call.
    pub async fn execute(&self, module: Arc<dyn ReconModule>, ctx: ModuleContext, event: Arc<Event>) -> SandboxReport {
        let name = module.name().to_string();
        let limits = module.descriptor().limits.clone();
        let timeout = self.timeout_for(&limits);

        let claim = match self.tracker.claim(&name, limits.max_threads).await {
            Ok(claim) => claim,
            Err(e) => {
                return SandboxReport {
                    outcome: WorkOutcome::from_error(&e),
                    elapsed: Duration::ZERO,
                    error: Some(e),
                    budget_exhausted: None,
                }
            }
        };
        let started = Instant::now();
        debug!(module = %name, threads = claim.threads(), timeout = ?timeout, "Sandbox claimed threads");

        let cancel = ctx.cancellation_token();
        let handler = tokio::spawn(async move { module.handle(&ctx, &event).await });
        let _guard = AbortOnDrop(handler.abort_handle());

        let error = match tokio::time::timeout(timeout, handler).await {
            Ok(Ok(result)) => result.err(),
            Ok(Err(join_error)) if join_error.is_panic() => Some(ModuleError::runtime(format!(
                "handler panicked: {}",
                panic_message(join_error.into_panic().as_ref())
            ))),
            Ok(Err(_)) => Some(ModuleError::Cancelled),
            Err(_) => {
                warn!(module = %name, timeout = ?timeout, "Module invocation timed out, interrupting");
                cancel.cancel();
                Some(ModuleError::Timeout(timeout))
            }
        };
        drop(claim);
        let outcome = error.as_ref().map_or(WorkOutcome::Completed, WorkOutcome::from_error);

        let elapsed = started.elapsed();
        let used = {
            let mut entry = self.runtime.entry(name.clone()).or_default();
            *entry += elapsed;
            *entry
        };
        let budget_exhausted = self
            .runtime_budget_for(&limits)
            .filter(|budget| used >= *budget)
            .map(|budget| ModuleError::BudgetExhausted { budget, used });

        SandboxReport {
            outcome,
            elapsed,
            error,
            budget_exhausted,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::SubmitOutcome;
    use crate::domain::module::{EventSink, ModuleConfig, ModuleDescriptor, ModuleKind};
    use crate::domain::scan::{ScanId, Target};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn notify(&self, _event: Event) -> SubmitOutcome {
            SubmitOutcome::Rejected {
                reason: crate::domain::event::RejectReason::Closed,
            }
        }
    }

    enum Behaviour {
        Ok,
        Fail,
        Panic,
        Hang,
    }

    struct TestModule {
        descriptor: ModuleDescriptor,
        behaviour: Behaviour,
    }

    impl TestModule {
        fn new(behaviour: Behaviour, limits: ResourceLimits) -> Arc<dyn ReconModule> {
            Arc::new(Self {
                descriptor: ModuleDescriptor::new("test", ModuleKind::Native)
                    .watching(["DOMAIN"])
                    .with_limits(limits),
                behaviour,
            })
        }
    }

    #[async_trait]
    impl ReconModule for TestModule {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn handle(&self, ctx: &ModuleContext, _event: &Event) -> Result<(), ModuleError> {
            match self.behaviour {
                Behaviour::Ok => Ok(()),
                Behaviour::Fail => Err(ModuleError::runtime("upstream returned 500")),
                Behaviour::Panic => panic!("index out of bounds"),
                Behaviour::Hang => {
                    ctx.cancelled().await;
                    Err(ModuleError::Cancelled)
                }
            }
        }
    }

    fn context(cancel: CancellationToken) -> (ModuleContext, Arc<Event>) {
        let target = Arc::new(Target::new("DOMAIN", "example.com").unwrap());
        let event = Arc::new(Event::root(&target));
        let ctx = ModuleContext::new(
            ScanId::new(),
            "test",
            target,
            Arc::new(ModuleConfig::default()),
            Arc::new(NullSink),
            cancel,
        );
        (ctx, event)
    }

    fn sandbox(global: usize, pool: usize) -> SandboxManager {
        SandboxManager::new(
            Arc::new(ResourceTracker::new(global)),
            pool,
            SandboxDefaults {
                timeout: Duration::from_secs(5),
                runtime_budget: None,
            },
        )
    }

    #[tokio::test]
    async fn test_completed_and_failed_outcomes() {
        let sandbox = sandbox(4, 2);

        let (ctx, event) = context(CancellationToken::new());
        let report = sandbox
            .execute(TestModule::new(Behaviour::Ok, ResourceLimits::default()), ctx, event)
            .await;
        assert_eq!(report.outcome, WorkOutcome::Completed);

        let (ctx, event) = context(CancellationToken::new());
        let report = sandbox
            .execute(TestModule::new(Behaviour::Fail, ResourceLimits::default()), ctx, event)
            .await;
        assert!(matches!(report.outcome, WorkOutcome::Failed { ref error } if error.contains("500")));
        assert_eq!(report.error, Some(ModuleError::runtime("upstream returned 500")));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let sandbox = sandbox(4, 2);
        let (ctx, event) = context(CancellationToken::new());
        let report = sandbox
            .execute(TestModule::new(Behaviour::Panic, ResourceLimits::default()), ctx, event)
            .await;
        assert!(matches!(report.outcome, WorkOutcome::Failed { ref error } if error.contains("panicked")));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_handler() {
        let sandbox = sandbox(4, 2);
        let limits = ResourceLimits {
            timeout: Some(Duration::from_millis(50)),
            ..ResourceLimits::default()
        };
        let scan_cancel = CancellationToken::new();
        let (ctx, event) = context(scan_cancel.child_token());

        let report = sandbox.execute(TestModule::new(Behaviour::Hang, limits), ctx, event).await;
        assert_eq!(report.outcome, WorkOutcome::TimedOut { after: Duration::from_millis(50) });
        assert_eq!(report.error, Some(ModuleError::Timeout(Duration::from_millis(50))));
        // Only the invocation token fires, never the scan's
        assert!(!scan_cancel.is_cancelled());
        assert_eq!(sandbox.tracker.in_use(), 0);
    }

    #[tokio::test]
    async fn test_scan_cancellation_reaches_handler() {
        let sandbox = sandbox(4, 2);
        let scan_cancel = CancellationToken::new();
        let (ctx, event) = context(scan_cancel.child_token());

        let canceller = scan_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let report = sandbox
            .execute(TestModule::new(Behaviour::Hang, ResourceLimits::default()), ctx, event)
            .await;
        assert_eq!(report.outcome, WorkOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_runtime_budget_accounting() {
        let sandbox = SandboxManager::new(
            Arc::new(ResourceTracker::new(4)),
            2,
            SandboxDefaults {
                timeout: Duration::from_secs(5),
                runtime_budget: Some(Duration::ZERO),
            },
        );
        let (ctx, event) = context(CancellationToken::new());
        let report = sandbox
            .execute(TestModule::new(Behaviour::Ok, ResourceLimits::default()), ctx, event)
            .await;
        assert_eq!(report.outcome, WorkOutcome::Completed);
        assert!(report.error.is_none());
        assert!(matches!(
            report.budget_exhausted,
            Some(ModuleError::BudgetExhausted { budget, .. }) if budget == Duration::ZERO
        ));
        assert!(sandbox.budget_exhausted("test", &ResourceLimits::default()));
    }

    #[tokio::test]
    async fn test_heavy_module_weight_is_capped() {
        let sandbox = sandbox(4, 3);
        let heavy = ResourceLimits {
            max_threads: 8,
            ..ResourceLimits::default()
        };
        assert_eq!(sandbox.weight(&heavy), 3);
        assert_eq!(sandbox.weight(&ResourceLimits::default()), 1);

        let tracker = Arc::new(ResourceTracker::new(4));
        let claim = tracker.claim("heavy", 8).await.unwrap();
        assert_eq!(claim.threads(), 4);
        assert_eq!(tracker.usage("heavy"), 4);
        assert_eq!(tracker.available(), 0);
        drop(claim);
        assert_eq!(tracker.usage("heavy"), 0);
        assert_eq!(tracker.available(), 4);
    }
}
