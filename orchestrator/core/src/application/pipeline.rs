// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Event Pipeline
//!
//! Scan-scoped dispatcher between modules. Every emitted event passes through
//! [`EventPipeline::submit`], which in order:
//!
//! 1. validates the event (non-empty data, known parent, no echo of the
//!    parent, depth limit, single root),
//! 2. deduplicates on the fingerprint,
//! 3. applies the confidence / visibility / false-positive filters,
//! 4. stamps the next sequence number and persists the event; a number is
//!    only consumed once the repository takes the event, so sequences stay
//!    gapless,
//! 5. hands one [`WorkItem`] per subscribed module to the execution engine.
//!
//! ## Drain Detection
//!
//! The pipeline counts work items that were created but not yet completed
//! (`inflight`) and submissions currently being processed (`pending`). A
//! handler's emitted events are submitted before its work item completes, so
//! both counters reach zero only when no more work can appear. That moment is
//! the scan's natural completion signal, observed with [`EventPipeline::wait_drained`].

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, trace};

use crate::application::resolver::ConsumerIndex;
use crate::domain::config::PipelineConfig;
use crate::domain::event::{Event, EventId, FilterReason, Fingerprint, RejectReason, SubmitOutcome};
use crate::domain::events::PipelineEvent;
use crate::domain::module::EventSink;
use crate::domain::repository::{EventRecord, EventRepository, RepositoryError};
use crate::domain::scan::ScanId;
use crate::domain::work::WorkItem;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::telemetry;

pub struct EventPipeline {
    scan_id: ScanId,
    config: PipelineConfig,
    index: Arc<ConsumerIndex>,
    seen: DashSet<Fingerprint>,
    accepted: DashMap<EventId, Arc<Event>>,
    root_seeded: AtomicBool,
    /// Last committed sequence number.
    sequence: Mutex<u64>,
    inflight: AtomicUsize,
    pending: AtomicUsize,
    drained: Notify,
    closed: AtomicBool,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    events: Arc<dyn EventRepository>,
    event_bus: EventBus,
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("scan_id", &self.scan_id)
            .field("accepted", &self.accepted.len())
            .field("sequence", &self.sequence.try_lock().map(|s| *s).ok())
            .field("inflight", &self.inflight.load(Ordering::Relaxed))
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts one submission as pending until dropped, including when the
/// submitting handler is aborted mid-call.
struct PendingGuard<'a>(&'a EventPipeline);

impl<'a> PendingGuard<'a> {
    fn new(pipeline: &'a EventPipeline) -> Self {
        pipeline.pending.fetch_add(1, Ordering::SeqCst);
        Self(pipeline)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify_if_drained();
        }
    }
}

impl EventPipeline {
    /// Returns the pipeline and the receiving end of its work-item channel,
    /// which belongs to the scan's execution engine.
    pub fn new(
        scan_id: ScanId,
        config: PipelineConfig,
        index: Arc<ConsumerIndex>,
        events: Arc<dyn EventRepository>,
        event_bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            scan_id,
            config,
            index,
            seen: DashSet::new(),
            accepted: DashMap::new(),
            root_seeded: AtomicBool::new(false),
            sequence: Mutex::new(0),
            inflight: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
            work_tx,
            events,
            event_bus,
        };
        (pipeline, work_rx)
    }

    pub fn scan_id(&self) -> ScanId {
        self.scan_id
    }

    /// Seed the dedup table with fingerprints accepted by an earlier run.
    pub fn bootstrap<I>(&self, fingerprints: I) -> usize
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        let seeded = fingerprints.into_iter().filter(|fp| self.seen.insert(fp.clone())).count();
        debug!(scan_id = %self.scan_id, seeded, "Bootstrapped dedup table");
        seeded
    }

    /// Accept, suppress or reject one event.
    pub async fn submit(&self, mut event: Event) -> SubmitOutcome {
        let _pending = PendingGuard::new(self);

        if let Err(reason) = self.validate(&event) {
            return self.reject(&event, reason);
        }

        // Dedup: one insert decides the winner among concurrent submitters
        if !self.seen.insert(event.fingerprint().clone()) {
            return self.suppress(&event);
        }
        if event.is_root() && self.root_seeded.swap(true, Ordering::SeqCst) {
            return self.reject(&event, RejectReason::RootAlreadySeeded);
        }

        let filtered = self.filter(&event);

        let sequence = {
            let mut last = self.sequence.lock().await;
            let sequence = *last + 1;
            event.stamp_sequence(sequence);
            match self.events.append(EventRecord::new(self.scan_id, event.clone())).await {
                Ok(()) => {}
                // Already persisted by an earlier run; the number is not consumed
                Err(RepositoryError::Conflict(_)) => return self.suppress(&event),
                Err(e) => {
                    // The scan keeps running on a persistence hiccup; the event is
                    // still routed so results stay complete for live observers.
                    error!(scan_id = %self.scan_id, fingerprint = %event.fingerprint().short(), error = %e, "Failed to persist accepted event");
                }
            }
            *last = sequence;
            sequence
        };

        let event = Arc::new(event);
        self.accepted.insert(event.id(), Arc::clone(&event));

        let dispatched = match filtered {
            Some(reason) => {
                debug!(
                    scan_id = %self.scan_id,
                    event_type = %event.event_type(),
                    reason = ?reason,
                    "Accepted event filtered from dispatch"
                );
                0
            }
            None => self.dispatch(&event),
        };

        telemetry::event_accepted();
        trace!(
            scan_id = %self.scan_id,
            event_type = %event.event_type(),
            source = %event.source_module(),
            sequence,
            dispatched,
            "Event accepted"
        );
        self.event_bus.publish_pipeline_event(PipelineEvent::EventAccepted {
            scan_id: self.scan_id,
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            data: event.data().to_string(),
            source_module: event.source_module().to_string(),
            sequence,
            dispatched,
            filtered,
            accepted_at: Utc::now(),
        });

        SubmitOutcome::Accepted {
            event_id: event.id(),
            sequence,
            dispatched,
            filtered,
        }
    }

    fn validate(&self, event: &Event) -> Result<(), RejectReason> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RejectReason::Closed);
        }
        if event.data().trim().is_empty() {
            return Err(RejectReason::EmptyData);
        }
        if event.is_root() {
            if self.root_seeded.load(Ordering::SeqCst) {
                return Err(RejectReason::RootAlreadySeeded);
            }
            return Ok(());
        }

        let parent = event
            .parent()
            .and_then(|id| self.accepted.get(&id).map(|p| Arc::clone(p.value())))
            .ok_or(RejectReason::UnknownParent)?;
        if parent.event_type() == event.event_type() && parent.data() == event.data() {
            return Err(RejectReason::EchoesParent);
        }
        if let Some(limit) = self.config.max_depth {
            if event.depth() > limit {
                return Err(RejectReason::DepthExceeded {
                    depth: event.depth(),
                    limit,
                });
            }
        }
        Ok(())
    }

    fn filter(&self, event: &Event) -> Option<FilterReason> {
        if event.is_root() {
            None
        } else if event.is_false_positive() && self.config.suppress_false_positives {
            Some(FilterReason::FalsePositive)
        } else if event.confidence() < self.config.min_confidence {
            Some(FilterReason::LowConfidence)
        } else if event.visibility() < self.config.min_visibility {
            Some(FilterReason::LowVisibility)
        } else {
            None
        }
    }

    fn dispatch(&self, event: &Arc<Event>) -> usize {
        let mut dispatched = 0;
        for module in self.index.consumers_of(event.event_type()) {
            // Never feed a module its own output
            if module == event.source_module() {
                continue;
            }
            self.inflight.fetch_add(1, Ordering::SeqCst);
            let item = WorkItem::new(self.scan_id, Arc::clone(event), module);
            if self.work_tx.send(item).is_err() {
                debug!(scan_id = %self.scan_id, module, "Execution engine gone, dropping work item");
                self.complete_work_item();
                continue;
            }
            dispatched += 1;
        }
        dispatched
    }

    fn reject(&self, event: &Event, reason: RejectReason) -> SubmitOutcome {
        debug!(
            scan_id = %self.scan_id,
            event_type = %event.event_type(),
            source = %event.source_module(),
            reason = %reason,
            "Event rejected"
        );
        self.event_bus.publish_pipeline_event(PipelineEvent::EventRejected {
            scan_id: self.scan_id,
            event_type: event.event_type().to_string(),
            source_module: event.source_module().to_string(),
            reason: reason.clone(),
            rejected_at: Utc::now(),
        });
        SubmitOutcome::Rejected { reason }
    }

    fn suppress(&self, event: &Event) -> SubmitOutcome {
        trace!(
            scan_id = %self.scan_id,
            fingerprint = %event.fingerprint().short(),
            source = %event.source_module(),
            "Duplicate event suppressed"
        );
        telemetry::event_suppressed();
        self.event_bus.publish_pipeline_event(PipelineEvent::EventSuppressed {
            scan_id: self.scan_id,
            fingerprint: event.fingerprint().clone(),
            source_module: event.source_module().to_string(),
            suppressed_at: Utc::now(),
        });
        SubmitOutcome::DuplicateSuppressed {
            fingerprint: event.fingerprint().clone(),
        }
    }

    /// Called by the engine once a work item reaches a terminal state.
    pub fn complete_work_item(&self) {
        let previous = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "work item completed twice");
        if previous == 1 {
            self.notify_if_drained();
        }
    }

    fn notify_if_drained(&self) {
        if self.is_drained() {
            self.drained.notify_waiters();
        }
    }

    pub fn is_drained(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0 && self.pending.load(Ordering::SeqCst) == 0
    }

    /// Resolves once no work item is in flight and no submission is pending.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting events. Later submissions are rejected with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn get(&self, id: EventId) -> Option<Arc<Event>> {
        self.accepted.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// `id` and its ancestors, nearest first, ending at the root.
    pub fn lineage(&self, id: EventId) -> Vec<Arc<Event>> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id);
        // An ancestor chain can be no longer than the set of accepted events
        let limit = self.accepted.len();
        while let Some(event) = cursor {
            if chain.len() > limit {
                break;
            }
            cursor = event.parent().and_then(|parent| self.get(parent));
            chain.push(event);
        }
        chain
    }
}

#[async_trait]
impl EventSink for EventPipeline {
    async fn notify(&self, event: Event) -> SubmitOutcome {
        self.submit(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::resolver::resolve;
    use crate::domain::event::EventType;
    use crate::domain::module::{ModuleDescriptor, ModuleKind};
    use crate::domain::scan::Target;
    use crate::infrastructure::repositories::InMemoryEventRepository;

    fn target() -> Target {
        Target::new("DOMAIN", "example.com").unwrap()
    }

    fn pipeline(config: PipelineConfig) -> (EventPipeline, mpsc::UnboundedReceiver<WorkItem>, InMemoryEventRepository) {
        let a = ModuleDescriptor::new("a", ModuleKind::Native)
            .watching(["DOMAIN"])
            .producing(["SUBDOMAIN"]);
        let b = ModuleDescriptor::new("b", ModuleKind::Native)
            .watching(["DOMAIN", "SUBDOMAIN"])
            .producing(["SUBDOMAIN"]);
        let resolution = resolve(&EventType::new("DOMAIN"), [&a, &b]);
        let repo = InMemoryEventRepository::new();
        let (pipeline, rx) = EventPipeline::new(
            ScanId::new(),
            config,
            Arc::new(resolution.index),
            Arc::new(repo.clone()),
            EventBus::new(64),
        );
        (pipeline, rx, repo)
    }

    async fn seed(pipeline: &EventPipeline) -> (Event, Event) {
        let root = Event::root(&target());
        assert!(pipeline.submit(root.clone()).await.is_accepted());
        let domain = Event::derived("DOMAIN", "example.com", "argus", &root);
        assert!(pipeline.submit(domain.clone()).await.is_accepted());
        (root, domain)
    }

    #[tokio::test]
    async fn test_duplicate_is_suppressed_and_dispatched_once() {
        let (pipeline, mut rx, repo) = pipeline(PipelineConfig::default());
        let (_, domain) = seed(&pipeline).await;
        // DOMAIN goes to both a and b
        assert_eq!(pipeline.inflight(), 2);

        let first = pipeline.submit(Event::derived("SUBDOMAIN", "www.example.com", "a", &domain)).await;
        let second = pipeline.submit(Event::derived("SUBDOMAIN", "www.example.com", "a", &domain)).await;

        // b watches SUBDOMAIN, a does not
        assert!(matches!(first, SubmitOutcome::Accepted { dispatched: 1, .. }));
        assert!(second.is_duplicate());
        assert_eq!(repo.count(pipeline.scan_id()), 3);

        let mut delivered = Vec::new();
        while let Ok(item) = rx.try_recv() {
            delivered.push((item.module().to_string(), item.event().event_type().to_string()));
        }
        assert_eq!(
            delivered,
            vec![
                ("a".to_string(), "DOMAIN".to_string()),
                ("b".to_string(), "DOMAIN".to_string()),
                ("b".to_string(), "SUBDOMAIN".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_fact_from_two_modules_is_kept_twice() {
        let (pipeline, _rx, _) = pipeline(PipelineConfig::default());
        let (_, domain) = seed(&pipeline).await;

        let from_a = pipeline.submit(Event::derived("SUBDOMAIN", "www.example.com", "a", &domain)).await;
        let from_b = pipeline.submit(Event::derived("SUBDOMAIN", "www.example.com", "b", &domain)).await;
        assert!(from_a.is_accepted());
        // Accepted, but not dispatched back to b itself
        assert!(matches!(from_b, SubmitOutcome::Accepted { dispatched: 0, .. }));
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let (pipeline, _rx, _) = pipeline(PipelineConfig::default());
        let (_, domain) = seed(&pipeline).await;

        let mut last = 0;
        for i in 0..5 {
            let event = Event::derived("SUBDOMAIN", format!("h{}.example.com", i), "a", &domain);
            match pipeline.submit(event).await {
                SubmitOutcome::Accepted { sequence, .. } => {
                    assert!(sequence > last);
                    last = sequence;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_guards_reject_invalid_events() {
        let config = PipelineConfig {
            max_depth: Some(2),
            ..PipelineConfig::default()
        };
        let (pipeline, _rx, _) = pipeline(config);
        let (root, domain) = seed(&pipeline).await;

        let orphan_parent = Event::root(&target());
        let orphan = Event::derived("SUBDOMAIN", "x.example.com", "a", &orphan_parent);
        assert_eq!(
            pipeline.submit(orphan).await,
            SubmitOutcome::Rejected { reason: RejectReason::UnknownParent }
        );

        let echo = Event::derived("DOMAIN", "example.com", "a", &domain);
        assert_eq!(
            pipeline.submit(echo).await,
            SubmitOutcome::Rejected { reason: RejectReason::EchoesParent }
        );

        let sub = Event::derived("SUBDOMAIN", "a.example.com", "a", &domain);
        assert!(pipeline.submit(sub.clone()).await.is_accepted());
        let too_deep = Event::derived("IP_ADDRESS", "10.0.0.1", "b", &sub);
        assert!(matches!(
            pipeline.submit(too_deep).await,
            SubmitOutcome::Rejected { reason: RejectReason::DepthExceeded { depth: 3, limit: 2 } }
        ));

        assert_eq!(
            pipeline.submit(Event::root(&target())).await,
            SubmitOutcome::Rejected { reason: RejectReason::RootAlreadySeeded }
        );

        let empty = Event::derived("SUBDOMAIN", "  ", "a", &root);
        assert_eq!(
            pipeline.submit(empty).await,
            SubmitOutcome::Rejected { reason: RejectReason::EmptyData }
        );
    }

    #[tokio::test]
    async fn test_filtered_events_are_accepted_without_dispatch() {
        let config = PipelineConfig {
            min_confidence: 50,
            ..PipelineConfig::default()
        };
        let (pipeline, _rx, repo) = pipeline(config);
        let (_, domain) = seed(&pipeline).await;

        let weak = Event::derived("SUBDOMAIN", "maybe.example.com", "a", &domain).with_confidence(10);
        assert!(matches!(
            pipeline.submit(weak).await,
            SubmitOutcome::Accepted { dispatched: 0, filtered: Some(FilterReason::LowConfidence), .. }
        ));

        let flagged = Event::derived("SUBDOMAIN", "fp.example.com", "a", &domain).with_false_positive(true);
        assert!(matches!(
            pipeline.submit(flagged).await,
            SubmitOutcome::Accepted { filtered: Some(FilterReason::FalsePositive), .. }
        ));
        assert_eq!(repo.count(pipeline.scan_id()), 4);
    }

    #[tokio::test]
    async fn test_bootstrap_suppresses_known_fingerprints() {
        let (pipeline, _rx, _) = pipeline(PipelineConfig::default());
        let (_, domain) = seed(&pipeline).await;
        let known = Event::derived("SUBDOMAIN", "old.example.com", "a", &domain);

        assert_eq!(pipeline.bootstrap([known.fingerprint().clone()]), 1);
        assert!(pipeline.submit(known).await.is_duplicate());
    }

    #[tokio::test]
    async fn test_drain_tracks_work_items() {
        let (pipeline, mut rx, _) = pipeline(PipelineConfig::default());
        assert!(pipeline.is_drained());

        seed(&pipeline).await;
        assert!(!pipeline.is_drained());

        while rx.try_recv().is_ok() {
            pipeline.complete_work_item();
        }
        assert!(pipeline.is_drained());
        tokio::time::timeout(std::time::Duration::from_secs(1), pipeline.wait_drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lineage_walks_to_root() {
        let (pipeline, _rx, _) = pipeline(PipelineConfig::default());
        let (root, domain) = seed(&pipeline).await;
        let sub = Event::derived("SUBDOMAIN", "www.example.com", "a", &domain);
        let id = sub.id();
        pipeline.submit(sub).await;

        let chain: Vec<EventId> = pipeline.lineage(id).iter().map(|e| e.id()).collect();
        assert_eq!(chain, vec![id, domain.id(), root.id()]);
    }

    #[tokio::test]
    async fn test_closed_pipeline_rejects() {
        let (pipeline, _rx, _) = pipeline(PipelineConfig::default());
        let (_, domain) = seed(&pipeline).await;
        pipeline.close();
        assert_eq!(
            pipeline.submit(Event::derived("SUBDOMAIN", "late.example.com", "a", &domain)).await,
            SubmitOutcome::Rejected { reason: RejectReason::Closed }
        );
    }
}
