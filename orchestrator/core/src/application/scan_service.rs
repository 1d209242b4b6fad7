// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Scan Service
//!
//! Entry point for callers: submit, inspect, cancel and resume scans.
//!
//! ```text
//! submit_scan ──► validate ──► Scan (CREATED) ──► AdmissionQueue ──► Throttled? ──► error
//!                                                      │
//!                                   scheduler: next_admitted()
//!                                                      │
//!                                                      ▼
//!   STARTING ──► instantiate + resolve + configure ──► seed ROOT and target
//!      │                                                   │
//!      └── setup failure ──► ERROR_FAILED                  ▼
//!                                          RUNNING ──► ExecutionEngine::run
//!                                                          │
//!                              drained ──► FINISHED        cancelled ──► ABORT_REQUESTED ──► ABORTED
//! ```
//!
//! The running slot taken at dequeue is given back after the scan's terminal
//! transition, which is what wakes the next queued scan.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::admission::{
    AdmissionDecision, AdmissionQueue, AdmissionSnapshot, PressureLevel, QueuedScan,
};
use crate::application::engine::{ActiveModule, EngineReport, ExecutionEngine};
use crate::application::pipeline::EventPipeline;
use crate::application::registry::ModuleRegistry;
use crate::application::repository_factory::Repositories;
use crate::application::resolver::resolve;
use crate::application::state_machine::{ScanStateMachine, StateMachineError};
use crate::domain::config::{EngineConfig, OrchestratorSpec, PipelineConfig, SandboxConfig};
use crate::domain::error::FatalScanError;
use crate::domain::event::{Event, EventId, CORE_MODULE};
use crate::domain::events::ScanLifecycleEvent;
use crate::domain::module::{ModuleOptions, ReconModule};
use crate::domain::repository::{LogLevel, ModuleLogRecord, RepositoryError};
use crate::domain::scan::{InvalidTransition, Scan, ScanId, ScanRequest, ScanState};
use crate::domain::work::{SkipReason, WorkItem};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::sandbox::{ResourceTracker, SandboxDefaults, SandboxManager};

#[derive(Debug, Error)]
pub enum ScanServiceError {
    /// Admission refused the scan; the caller retries later.
    #[error("Scan admission throttled (pressure {pressure})")]
    Throttled { pressure: PressureLevel },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Scan {scan_id} cannot be resumed from state {state}")]
    NotResumable { scan_id: ScanId, state: ScanState },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl From<StateMachineError> for ScanServiceError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::InvalidTransition(e) => ScanServiceError::InvalidTransition(e),
            StateMachineError::Repository(e) => ScanServiceError::Repository(e),
        }
    }
}

#[async_trait]
pub trait ScanService: Send + Sync {
    /// Queue a scan. Returns its id once admission accepted it.
    async fn submit_scan(&self, request: ScanRequest) -> Result<ScanId, ScanServiceError>;

    async fn get_status(&self, scan_id: ScanId) -> Result<Scan, ScanServiceError>;

    /// Request cancellation. A queued scan is withdrawn and ends `ABORTED`
    /// directly; a running one goes through `ABORT_REQUESTED`.
    async fn cancel(&self, scan_id: ScanId) -> Result<(), ScanServiceError>;

    /// Re-queue an `ABORTED` or `ERROR_FAILED` scan as a new scan whose dedup
    /// table starts from the old scan's findings.
    async fn resume(&self, scan_id: ScanId) -> Result<ScanId, ScanServiceError>;

    /// Resolves once the scan is terminal.
    async fn wait_for_completion(&self, scan_id: ScanId) -> Result<Scan, ScanServiceError>;

    async fn list_scans(&self, limit: usize) -> Result<Vec<Scan>, ScanServiceError>;

    async fn scan_events(&self, scan_id: ScanId) -> Result<Vec<Event>, ScanServiceError>;

    async fn module_log(
        &self,
        scan_id: ScanId,
        module: Option<&str>,
    ) -> Result<Vec<ModuleLogRecord>, ScanServiceError>;

    /// Advisory flag for reporting. Work already dispatched is not retracted.
    async fn mark_false_positive(
        &self,
        scan_id: ScanId,
        event_id: EventId,
        false_positive: bool,
    ) -> Result<(), ScanServiceError>;
}

struct ScanHandle {
    machine: Arc<ScanStateMachine>,
    cancel: CancellationToken,
    resume_from: Option<ScanId>,
}

/// Everything one admitted scan runs with.
struct PreparedScan {
    engine: Arc<ExecutionEngine>,
    pipeline: Arc<EventPipeline>,
    work_rx: tokio::sync::mpsc::UnboundedReceiver<WorkItem>,
    instances: Vec<Arc<dyn ReconModule>>,
}

pub struct StandardScanService {
    engine_config: EngineConfig,
    sandbox_config: SandboxConfig,
    pipeline_config: PipelineConfig,
    registry: Arc<ModuleRegistry>,
    repositories: Repositories,
    admission: Arc<AdmissionQueue>,
    tracker: Arc<ResourceTracker>,
    event_bus: EventBus,
    active: DashMap<ScanId, Arc<ScanHandle>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for StandardScanService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardScanService")
            .field("registry", &self.registry)
            .field("admission", &self.admission)
            .field("active_scans", &self.active.len())
            .finish()
    }
}

impl StandardScanService {
    pub fn new(
        config: &OrchestratorSpec,
        registry: ModuleRegistry,
        repositories: Repositories,
        event_bus: EventBus,
    ) -> Self {
        Self {
            engine_config: config.engine.clone(),
            sandbox_config: config.sandbox.clone(),
            pipeline_config: config.pipeline.clone(),
            registry: Arc::new(registry),
            repositories,
            admission: Arc::new(AdmissionQueue::new(config.admission.clone())),
            tracker: Arc::new(ResourceTracker::new(config.sandbox.global_thread_budget)),
            event_bus,
            active: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        self.admission.snapshot()
    }

    /// Spawn the scheduler that moves admitted scans into execution.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_scheduler().await })
    }

    /// Stop the scheduler and cancel every running scan.
    pub fn shutdown(&self) {
        info!(active = self.active.len(), "Scan service shutting down");
        self.shutdown.cancel();
    }

    async fn run_scheduler(self: Arc<Self>) {
        info!(
            max_running = self.admission.snapshot().max_running,
            "Scan scheduler started"
        );
        loop {
            let queued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                queued = self.admission.next_admitted() => queued,
            };
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.run_admitted(queued).await });
        }
        debug!("Scan scheduler stopped");
    }

    async fn run_admitted(&self, queued: QueuedScan) {
        let Some(handle) = self.handle(queued.scan_id) else {
            warn!(scan_id = %queued.scan_id, "Admitted scan has no handle, releasing slot");
            self.admission.release_slot();
            return;
        };

        let waited = Utc::now() - queued.enqueued_at;
        let span = info_span!("scan", scan_id = %queued.scan_id, priority = queued.priority.as_str());
        async {
            debug!(waited_ms = waited.num_milliseconds(), "Scan admitted");
            self.run_scan(&handle).await;
        }
        .instrument(span)
        .await;

        self.active.remove(&queued.scan_id);
        self.admission.release_slot();
    }

    async fn run_scan(&self, handle: &ScanHandle) {
        let machine = &handle.machine;
        let scan_id = machine.scan_id();

        match machine.try_transition(ScanState::Starting, None).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(scan_id = %scan_id, status = %machine.status(), "Scan left CREATED before it could start");
                return;
            }
            Err(e) => {
                error!(scan_id = %scan_id, error = %e, "Failed to persist scan start");
                self.finish(machine, ScanState::Aborted, Some(e.to_string())).await;
                return;
            }
        }

        let scan = machine.snapshot();
        let prepared = match self.prepare(&scan, handle).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(scan_id = %scan_id, error = %e, "Scan setup failed");
                self.finish(machine, ScanState::ErrorFailed, Some(e.to_string())).await;
                return;
            }
        };

        if let Err(e) = machine.transition(ScanState::Running, None).await {
            error!(scan_id = %scan_id, error = %e, "Failed to persist scan run");
            prepared.pipeline.close();
            shutdown_modules(&prepared.instances).await;
            self.finish(machine, ScanState::ErrorFailed, Some(e.to_string())).await;
            return;
        }
        if handle.cancel.is_cancelled() {
            self.request_abort(machine, "cancelled during setup").await;
        }

        let report = Arc::clone(&prepared.engine).run(prepared.work_rx).await;
        prepared.pipeline.close();
        shutdown_modules(&prepared.instances).await;
        self.complete(machine, &report).await;
    }

    async fn prepare(&self, scan: &Scan, handle: &ScanHandle) -> Result<PreparedScan, FatalScanError> {
        let scan_id = scan.id;

        let mut instances = Vec::with_capacity(scan.enabled_modules.len());
        for name in &scan.enabled_modules {
            let module = self
                .registry
                .instantiate(name)
                .ok_or_else(|| FatalScanError::UnknownModule(name.clone()))?;
            instances.push(module);
        }

        let resolution = resolve(scan.target.target_type(), instances.iter().map(|m| m.descriptor()));
        for warning in &resolution.warnings {
            self.log(scan_id, warning.module(), LogLevel::Warn, warning.to_string()).await;
        }
        self.event_bus.publish_scan_event(ScanLifecycleEvent::ScanResolved {
            scan_id,
            active_modules: resolution.active.clone(),
            excluded_modules: resolution.excluded.clone(),
            warnings: resolution.warnings.iter().map(ToString::to_string).collect(),
            resolved_at: Utc::now(),
        });

        let no_options = ModuleOptions::new();
        let mut active = HashMap::new();
        let mut setup_failures = Vec::new();
        for module in instances.iter().filter(|m| resolution.is_active(m.name())) {
            let options = scan.options.get(module.name()).unwrap_or(&no_options);
            match module.configure(options) {
                Ok(config) => {
                    active.insert(
                        module.name().to_string(),
                        ActiveModule {
                            module: Arc::clone(module),
                            config: Arc::new(config),
                        },
                    );
                }
                Err(e) => {
                    warn!(scan_id = %scan_id, module = %module.name(), error = %e, "Module configuration rejected");
                    setup_failures.push((module.name().to_string(), e));
                }
            }
        }
        if active.is_empty() {
            return Err(FatalScanError::NoUsableModules);
        }
        info!(
            scan_id = %scan_id,
            active = active.len(),
            excluded = resolution.excluded.len(),
            setup_failed = setup_failures.len(),
            "Modules resolved"
        );

        let (pipeline, work_rx) = EventPipeline::new(
            scan_id,
            self.pipeline_config.clone(),
            Arc::new(resolution.index),
            Arc::clone(&self.repositories.events),
            self.event_bus.clone(),
        );
        let pipeline = Arc::new(pipeline);

        if let Some(source) = handle.resume_from {
            let fingerprints = self
                .repositories
                .events
                .events(source)
                .await?
                .into_iter()
                .filter(|event| event.source_module() != CORE_MODULE)
                .map(|event| event.fingerprint().clone());
            let seeded = pipeline.bootstrap(fingerprints);
            info!(scan_id = %scan_id, resumed_from = %source, seeded, "Dedup table bootstrapped from earlier scan");
        }

        let sandbox = Arc::new(SandboxManager::new(
            Arc::clone(&self.tracker),
            self.engine_config.max_threads,
            SandboxDefaults {
                timeout: self.sandbox_config.default_timeout(),
                runtime_budget: self.sandbox_config.default_runtime_budget(),
            },
        ));
        let engine = Arc::new(ExecutionEngine::new(
            scan_id,
            Arc::new(scan.target.clone()),
            self.engine_config.clone(),
            active,
            sandbox,
            Arc::clone(&pipeline),
            Arc::clone(&self.repositories.logs),
            self.event_bus.clone(),
            handle.cancel.clone(),
        ));
        for (module, error) in setup_failures {
            engine
                .disable(&module, SkipReason::SetupFailed { message: error.to_string() })
                .await;
        }

        let root = Event::root(&scan.target);
        let target_event = Event::derived(
            scan.target.target_type().clone(),
            scan.target.value(),
            CORE_MODULE,
            &root,
        );
        let outcome = pipeline.submit(root).await;
        if !outcome.is_accepted() {
            return Err(FatalScanError::Seed(format!("root event not accepted: {:?}", outcome)));
        }
        let outcome = pipeline.submit(target_event).await;
        if !outcome.is_accepted() && !outcome.is_duplicate() {
            return Err(FatalScanError::Seed(format!("target event not accepted: {:?}", outcome)));
        }

        Ok(PreparedScan {
            engine,
            pipeline,
            work_rx,
            instances,
        })
    }

    /// Terminal transition after the engine stopped.
    async fn complete(&self, machine: &ScanStateMachine, report: &EngineReport) {
        if !report.interrupted {
            match machine.try_transition(ScanState::Finished, None).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    error!(scan_id = %machine.scan_id(), error = %e, "Failed to persist scan completion");
                    self.finish(machine, ScanState::ErrorFailed, Some(e.to_string())).await;
                    return;
                }
            }
        }
        // Cancelled, or a cancel request raced natural completion
        self.request_abort(machine, "scan cancelled").await;
        self.finish(machine, ScanState::Aborted, None).await;
    }

    async fn request_abort(&self, machine: &ScanStateMachine, reason: &str) {
        if machine.status() == ScanState::Running {
            if let Err(e) = machine
                .try_transition(ScanState::AbortRequested, Some(reason.to_string()))
                .await
            {
                error!(scan_id = %machine.scan_id(), error = %e, "Failed to persist abort request");
            }
        }
    }

    async fn finish(&self, machine: &ScanStateMachine, state: ScanState, reason: Option<String>) {
        if let Err(e) = machine.transition(state, reason).await {
            error!(scan_id = %machine.scan_id(), to = %state, error = %e, "Failed to record terminal state");
        }
    }

    async fn enqueue(&self, request: ScanRequest, resume_from: Option<ScanId>) -> Result<ScanId, ScanServiceError> {
        self.validate(&request)?;
        let priority = request.priority;

        let scan = Scan::new(request);
        let scan_id = scan.id;
        let machine = ScanStateMachine::new(scan, Arc::clone(&self.repositories.scans), self.event_bus.clone()).await?;
        let handle = Arc::new(ScanHandle {
            machine: Arc::new(machine),
            cancel: self.shutdown.child_token(),
            resume_from,
        });
        self.active.insert(scan_id, handle);

        match self.admission.enqueue(scan_id, priority) {
            AdmissionDecision::Accepted { pressure, queue_depth } => {
                if pressure == PressureLevel::Normal {
                    info!(scan_id = %scan_id, priority = priority.as_str(), queue_depth, "Scan queued");
                } else {
                    warn!(scan_id = %scan_id, priority = priority.as_str(), queue_depth, pressure = %pressure, "Scan queued under backpressure");
                }
                self.event_bus.publish_scan_event(ScanLifecycleEvent::ScanQueued {
                    scan_id,
                    priority,
                    queue_depth,
                    queued_at: Utc::now(),
                });
                Ok(scan_id)
            }
            AdmissionDecision::Throttled { pressure, .. } => {
                self.active.remove(&scan_id);
                self.repositories.scans.delete(scan_id).await?;
                Err(ScanServiceError::Throttled { pressure })
            }
        }
    }

    fn validate(&self, request: &ScanRequest) -> Result<(), ScanServiceError> {
        if request.modules.is_empty() {
            return Err(ScanServiceError::InvalidRequest("no modules enabled".to_string()));
        }
        let mut seen = HashSet::new();
        for name in &request.modules {
            if !seen.insert(name.as_str()) {
                return Err(ScanServiceError::InvalidRequest(format!("module '{}' listed twice", name)));
            }
            if !self.registry.contains(name) {
                return Err(ScanServiceError::UnknownModule(name.clone()));
            }
        }
        if let Some(unknown) = request.options.keys().find(|module| !seen.contains(module.as_str())) {
            return Err(ScanServiceError::InvalidRequest(format!(
                "options supplied for module '{}' which is not enabled",
                unknown
            )));
        }
        Ok(())
    }

    fn handle(&self, scan_id: ScanId) -> Option<Arc<ScanHandle>> {
        self.active.get(&scan_id).map(|entry| Arc::clone(entry.value()))
    }

    async fn find_scan(&self, scan_id: ScanId) -> Result<Scan, ScanServiceError> {
        self.repositories
            .scans
            .find_by_id(scan_id)
            .await?
            .ok_or_else(|| ScanServiceError::NotFound(format!("scan {}", scan_id)))
    }

    async fn log(&self, scan_id: ScanId, module: &str, level: LogLevel, message: String) {
        let record = ModuleLogRecord::new(scan_id, module, level, message);
        if let Err(e) = self.repositories.logs.append(record).await {
            error!(scan_id = %scan_id, module, error = %e, "Failed to persist module log record");
        }
    }
}

async fn shutdown_modules(instances: &[Arc<dyn ReconModule>]) {
    for module in instances {
        module.shutdown().await;
    }
}

#[async_trait]
impl ScanService for StandardScanService {
    async fn submit_scan(&self, request: ScanRequest) -> Result<ScanId, ScanServiceError> {
        self.enqueue(request, None).await
    }

    async fn get_status(&self, scan_id: ScanId) -> Result<Scan, ScanServiceError> {
        match self.handle(scan_id) {
            Some(handle) => Ok(handle.machine.snapshot()),
            None => self.find_scan(scan_id).await,
        }
    }

    async fn cancel(&self, scan_id: ScanId) -> Result<(), ScanServiceError> {
        let Some(handle) = self.handle(scan_id) else {
            let scan = self.find_scan(scan_id).await?;
            return Err(InvalidTransition {
                from: scan.status(),
                to: ScanState::AbortRequested,
            }
            .into());
        };
        let machine = &handle.machine;

        match machine.status() {
            ScanState::Created => {
                handle.cancel.cancel();
                if self.admission.withdraw(scan_id) {
                    machine
                        .transition(ScanState::Aborted, Some("cancelled before start".to_string()))
                        .await?;
                    self.active.remove(&scan_id);
                }
                // Otherwise already dequeued; the runner sees the token.
            }
            ScanState::Starting => handle.cancel.cancel(),
            ScanState::Running => {
                machine
                    .transition(ScanState::AbortRequested, Some("cancel requested".to_string()))
                    .await?;
                handle.cancel.cancel();
            }
            ScanState::AbortRequested => {}
            terminal => {
                return Err(InvalidTransition {
                    from: terminal,
                    to: ScanState::AbortRequested,
                }
                .into())
            }
        }
        info!(scan_id = %scan_id, "Scan cancellation requested");
        Ok(())
    }

    async fn resume(&self, scan_id: ScanId) -> Result<ScanId, ScanServiceError> {
        let scan = self.get_status(scan_id).await?;
        match scan.status() {
            ScanState::Aborted | ScanState::ErrorFailed => {}
            state => return Err(ScanServiceError::NotResumable { scan_id, state }),
        }
        let resumed = self.enqueue(scan.request(), Some(scan_id)).await?;
        info!(scan_id = %resumed, resumed_from = %scan_id, "Scan resumed");
        Ok(resumed)
    }

    async fn wait_for_completion(&self, scan_id: ScanId) -> Result<Scan, ScanServiceError> {
        match self.handle(scan_id) {
            Some(handle) => {
                handle.machine.wait_terminal().await;
                Ok(handle.machine.snapshot())
            }
            None => self.find_scan(scan_id).await,
        }
    }

    async fn list_scans(&self, limit: usize) -> Result<Vec<Scan>, ScanServiceError> {
        Ok(self.repositories.scans.list_recent(limit).await?)
    }

    async fn scan_events(&self, scan_id: ScanId) -> Result<Vec<Event>, ScanServiceError> {
        Ok(self.repositories.events.events(scan_id).await?)
    }

    async fn module_log(
        &self,
        scan_id: ScanId,
        module: Option<&str>,
    ) -> Result<Vec<ModuleLogRecord>, ScanServiceError> {
        Ok(self.repositories.logs.find_by_scan(scan_id, module).await?)
    }

    async fn mark_false_positive(
        &self,
        scan_id: ScanId,
        event_id: EventId,
        false_positive: bool,
    ) -> Result<(), ScanServiceError> {
        match self
            .repositories
            .events
            .set_false_positive(scan_id, event_id, false_positive)
            .await
        {
            Ok(()) => {
                debug!(scan_id = %scan_id, event_id = %event_id, false_positive, "Event false-positive flag updated");
                Ok(())
            }
            Err(RepositoryError::NotFound(what)) => Err(ScanServiceError::NotFound(what)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::AdmissionConfig;
    use crate::domain::error::ModuleError;
    use crate::domain::module::{ModuleContext, ModuleDescriptor, ModuleKind, OptionKind, OptionSpec};
    use crate::domain::scan::Target;
    use std::time::Duration;

    struct Echo {
        descriptor: ModuleDescriptor,
    }

    impl Echo {
        fn factory(name: &'static str) -> impl Fn() -> Arc<dyn ReconModule> + Send + Sync + 'static {
            move || {
                Arc::new(Echo {
                    descriptor: ModuleDescriptor::new(name, ModuleKind::Native)
                        .watching(["DOMAIN"])
                        .producing(["SUBDOMAIN"]),
                }) as Arc<dyn ReconModule>
            }
        }
    }

    #[async_trait]
    impl ReconModule for Echo {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn handle(&self, ctx: &ModuleContext, event: &Event) -> Result<(), ModuleError> {
            ctx.emit("SUBDOMAIN", format!("www.{}", event.data()), event).await;
            Ok(())
        }
    }

    struct Keyed {
        descriptor: ModuleDescriptor,
    }

    #[async_trait]
    impl ReconModule for Keyed {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }

        async fn handle(&self, _ctx: &ModuleContext, _event: &Event) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    fn service(admission: AdmissionConfig) -> Arc<StandardScanService> {
        let mut registry = ModuleRegistry::new();
        registry.register(Echo::factory("echo")).unwrap();
        registry
            .register(|| {
                Arc::new(Keyed {
                    descriptor: ModuleDescriptor::new("keyed", ModuleKind::Native)
                        .watching(["DOMAIN"])
                        .with_option(OptionSpec::new("api_key", OptionKind::String).required()),
                }) as Arc<dyn ReconModule>
            })
            .unwrap();
        let spec = OrchestratorSpec {
            admission,
            ..OrchestratorSpec::default()
        };
        Arc::new(StandardScanService::new(
            &spec,
            registry,
            Repositories::in_memory(),
            EventBus::new(256),
        ))
    }

    fn request(modules: &[&str]) -> ScanRequest {
        ScanRequest::new(Target::new("DOMAIN", "example.com").unwrap(), modules.iter().copied())
    }

    #[tokio::test]
    async fn test_unknown_module_is_rejected_at_submit() {
        let service = service(AdmissionConfig::default());
        let err = service.submit_scan(request(&["echo", "nope"])).await.unwrap_err();
        assert!(matches!(err, ScanServiceError::UnknownModule(name) if name == "nope"));
        assert!(service.list_scans(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_runs_to_finished() {
        let service = service(AdmissionConfig::default());
        service.start();

        let scan_id = service.submit_scan(request(&["echo"])).await.unwrap();
        let scan = tokio::time::timeout(Duration::from_secs(5), service.wait_for_completion(scan_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scan.status(), ScanState::Finished);

        let events = service.scan_events(scan_id).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type().as_str()).collect();
        assert_eq!(types, vec!["ROOT", "DOMAIN", "SUBDOMAIN"]);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_module_not_scan() {
        let service = service(AdmissionConfig::default());
        service.start();

        let scan_id = service.submit_scan(request(&["echo", "keyed"])).await.unwrap();
        let scan = tokio::time::timeout(Duration::from_secs(5), service.wait_for_completion(scan_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scan.status(), ScanState::Finished);

        let log = service.module_log(scan_id, Some("keyed")).await.unwrap();
        assert!(log.iter().any(|r| r.message.contains("module disabled")));
    }

    #[tokio::test]
    async fn test_only_unusable_modules_fails_scan() {
        let service = service(AdmissionConfig::default());
        service.start();

        let scan_id = service.submit_scan(request(&["keyed"])).await.unwrap();
        let scan = tokio::time::timeout(Duration::from_secs(5), service.wait_for_completion(scan_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scan.status(), ScanState::ErrorFailed);
        assert!(scan.failure.unwrap().contains("No enabled module"));
        let resumed = service.resume(scan_id).await.unwrap();
        assert_ne!(resumed, scan_id);
    }

    #[tokio::test]
    async fn test_cancel_queued_scan_aborts_directly() {
        // Scheduler never started: the scan stays queued
        let service = service(AdmissionConfig::default());
        let scan_id = service.submit_scan(request(&["echo"])).await.unwrap();

        service.cancel(scan_id).await.unwrap();
        let scan = service.get_status(scan_id).await.unwrap();
        assert_eq!(scan.status(), ScanState::Aborted);
        assert_eq!(service.admission_snapshot().queued(), 0);

        let err = service.cancel(scan_id).await.unwrap_err();
        assert!(matches!(err, ScanServiceError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_throttled_scan_is_not_kept() {
        let service = service(AdmissionConfig {
            max_running_scans: 1,
            elevated_depth: 1,
            critical_depth: 1,
            max_queue_depth: 4,
        });
        service.submit_scan(request(&["echo"])).await.unwrap();

        let err = service.submit_scan(request(&["echo"])).await.unwrap_err();
        assert!(matches!(
            err,
            ScanServiceError::Throttled {
                pressure: PressureLevel::Critical
            }
        ));
        assert_eq!(service.list_scans(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_requires_terminal_failure() {
        let service = service(AdmissionConfig::default());
        let scan_id = service.submit_scan(request(&["echo"])).await.unwrap();
        let err = service.resume(scan_id).await.unwrap_err();
        assert!(matches!(
            err,
            ScanServiceError::NotResumable {
                state: ScanState::Created,
                ..
            }
        ));
    }
}
