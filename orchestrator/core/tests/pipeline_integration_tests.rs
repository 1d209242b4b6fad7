//! Integration tests for the per-scan event pipeline
//!
//! Covers dedup under concurrent submission, lineage integrity and routing:
//! work is only produced for modules that watch the event's type, and a
//! module is never handed its own output.

use argus_core::application::pipeline::EventPipeline;
use argus_core::application::resolver::resolve;
use argus_core::domain::config::PipelineConfig;
use argus_core::domain::event::{Event, EventType, FilterReason, RejectReason, SubmitOutcome, CORE_MODULE};
use argus_core::domain::module::{ModuleDescriptor, ModuleKind};
use argus_core::domain::repository::{EventRecord, EventRepository};
use argus_core::domain::scan::{ScanId, Target};
use argus_core::domain::work::WorkItem;
use argus_core::infrastructure::event_bus::EventBus;
use argus_core::infrastructure::repositories::InMemoryEventRepository;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    scan_id: ScanId,
    pipeline: Arc<EventPipeline>,
    work_rx: UnboundedReceiver<WorkItem>,
    events: Arc<InMemoryEventRepository>,
    root: Event,
    target_event: Event,
}

impl Harness {
    async fn new(modules: &[ModuleDescriptor], config: PipelineConfig) -> Self {
        let scan_id = ScanId::new();
        let target = Target::new("DOMAIN", "example.com").unwrap();
        let resolution = resolve(target.target_type(), modules.iter());
        let events = Arc::new(InMemoryEventRepository::new());
        let (pipeline, work_rx) = EventPipeline::new(
            scan_id,
            config,
            Arc::new(resolution.index),
            events.clone(),
            EventBus::new(256),
        );
        let pipeline = Arc::new(pipeline);

        let root = Event::root(&target);
        assert!(pipeline.submit(root.clone()).await.is_accepted());
        let target_event = Event::derived("DOMAIN", "example.com", CORE_MODULE, &root);
        assert!(pipeline.submit(target_event.clone()).await.is_accepted());

        Self {
            scan_id,
            pipeline,
            work_rx,
            events,
            root,
            target_event,
        }
    }

    fn drain_work(&mut self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Ok(item) = self.work_rx.try_recv() {
            items.push(item);
        }
        items
    }
}

fn native(name: &str, watches: &[&str], produces: &[&str]) -> ModuleDescriptor {
    ModuleDescriptor::new(name, ModuleKind::Native)
        .watching(watches.iter().copied())
        .producing(produces.iter().copied())
}

#[tokio::test]
async fn test_concurrent_duplicates_accept_exactly_one() {
    let modules = [native("dns", &["DOMAIN"], &["SUBDOMAIN"])];
    let harness = Harness::new(&modules, PipelineConfig::default()).await;

    // Same (type, data, source) built independently, so every copy has its own id
    let submissions = (0..16).map(|_| {
        let pipeline = Arc::clone(&harness.pipeline);
        let event = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
        tokio::spawn(async move { pipeline.submit(event).await })
    });
    let outcomes: Vec<SubmitOutcome> = futures::future::join_all(submissions)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 15);
    // ROOT, DOMAIN and the one SUBDOMAIN
    assert_eq!(harness.events.count(harness.scan_id), 3);
    assert_eq!(harness.pipeline.accepted_count(), 3);
}

#[tokio::test]
async fn test_same_data_from_another_module_is_distinct() {
    let modules = [
        native("a", &["DOMAIN"], &["SUBDOMAIN"]),
        native("b", &["DOMAIN"], &["SUBDOMAIN"]),
    ];
    let harness = Harness::new(&modules, PipelineConfig::default()).await;

    let from_a = Event::derived("SUBDOMAIN", "www.example.com", "a", &harness.target_event);
    let from_b = Event::derived("SUBDOMAIN", "www.example.com", "b", &harness.target_event);
    assert!(harness.pipeline.submit(from_a.clone()).await.is_accepted());
    assert!(harness.pipeline.submit(from_b).await.is_accepted());
    assert!(harness.pipeline.submit(from_a).await.is_duplicate());
}

#[tokio::test]
async fn test_sequence_numbers_are_gapless_across_suppression() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;
    let event = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);

    let first = harness.pipeline.submit(event.clone()).await;
    let _ = harness.pipeline.submit(event).await;
    let next = Event::derived("SUBDOMAIN", "mail.example.com", "dns", &harness.target_event);
    let second = harness.pipeline.submit(next).await;

    let sequence = |outcome: &SubmitOutcome| match outcome {
        SubmitOutcome::Accepted { sequence, .. } => *sequence,
        other => panic!("expected acceptance, got {:?}", other),
    };
    assert_eq!(sequence(&first), 3);
    assert_eq!(sequence(&second), 4);
}

#[tokio::test]
async fn test_already_persisted_event_does_not_consume_a_sequence() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;

    let stored = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    harness
        .events
        .append(EventRecord::new(harness.scan_id, stored))
        .await
        .unwrap();

    let replay = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    assert!(harness.pipeline.submit(replay).await.is_duplicate());

    let next = Event::derived("SUBDOMAIN", "mail.example.com", "dns", &harness.target_event);
    assert!(matches!(
        harness.pipeline.submit(next).await,
        SubmitOutcome::Accepted { sequence: 3, .. }
    ));
}

#[tokio::test]
async fn test_lineage_walks_back_to_root_without_cycles() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;

    let subdomain = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    let ip = Event::derived("IP_ADDRESS", "93.184.216.34", "resolver", &subdomain);
    let netblock = Event::derived("NETBLOCK", "93.184.216.0/24", "whois", &ip);
    for event in [&subdomain, &ip, &netblock] {
        assert!(harness.pipeline.submit(event.clone()).await.is_accepted());
    }

    let chain = harness.pipeline.lineage(netblock.id());
    let types: Vec<&str> = chain.iter().map(|e| e.event_type().as_str()).collect();
    assert_eq!(types, vec!["NETBLOCK", "IP_ADDRESS", "SUBDOMAIN", "DOMAIN", "ROOT"]);

    let ids: HashSet<_> = chain.iter().map(|e| e.id()).collect();
    assert_eq!(ids.len(), chain.len());
    assert!(chain.windows(2).all(|pair| pair[0].depth() == pair[1].depth() + 1));
    assert_eq!(chain.last().unwrap().id(), harness.root.id());
}

#[tokio::test]
async fn test_unknown_parent_and_echo_are_rejected() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;

    let orphan_parent = Event::derived("SUBDOMAIN", "never.example.com", "dns", &harness.target_event);
    let orphan = Event::derived("IP_ADDRESS", "10.0.0.1", "resolver", &orphan_parent);
    let outcome = harness.pipeline.submit(orphan).await;
    assert!(matches!(outcome, SubmitOutcome::Rejected { reason: RejectReason::UnknownParent }));

    let echo = Event::derived("DOMAIN", "example.com", "dns", &harness.target_event);
    let outcome = harness.pipeline.submit(echo).await;
    assert!(matches!(outcome, SubmitOutcome::Rejected { reason: RejectReason::EchoesParent }));

    let second_root = Event::root(&Target::new("DOMAIN", "example.com").unwrap());
    let outcome = harness.pipeline.submit(second_root).await;
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
}

#[tokio::test]
async fn test_work_only_reaches_watching_modules() {
    let modules = [
        native("dns", &["DOMAIN"], &["SUBDOMAIN"]),
        native("resolver", &["SUBDOMAIN"], &["IP_ADDRESS"]),
        native("hashes", &["HASH"], &["MALWARE"]),
    ];
    let mut harness = Harness::new(&modules, PipelineConfig::default()).await;

    let seeded: Vec<String> = harness.drain_work().iter().map(|w| w.module().to_string()).collect();
    assert_eq!(seeded, vec!["dns"]);

    let subdomain = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    harness.pipeline.submit(subdomain.clone()).await;
    let routed: Vec<String> = harness.drain_work().iter().map(|w| w.module().to_string()).collect();
    assert_eq!(routed, vec!["resolver"]);

    // Nobody watches IP_ADDRESS: stored, but no work item
    let ip = Event::derived("IP_ADDRESS", "93.184.216.34", "resolver", &subdomain);
    let outcome = harness.pipeline.submit(ip).await;
    assert!(matches!(outcome, SubmitOutcome::Accepted { dispatched: 0, .. }));
    assert!(harness.drain_work().is_empty());
}

#[tokio::test]
async fn test_module_never_receives_its_own_output() {
    let modules = [native("permute", &["SUBDOMAIN", "DOMAIN"], &["SUBDOMAIN"])];
    let mut harness = Harness::new(&modules, PipelineConfig::default()).await;
    harness.drain_work();

    let own = Event::derived("SUBDOMAIN", "dev.example.com", "permute", &harness.target_event);
    let outcome = harness.pipeline.submit(own).await;
    assert!(matches!(outcome, SubmitOutcome::Accepted { dispatched: 0, .. }));
    assert!(harness.drain_work().is_empty());
}

#[tokio::test]
async fn test_filtered_events_are_stored_but_not_routed() {
    let modules = [native("resolver", &["SUBDOMAIN"], &["IP_ADDRESS"])];
    let config = PipelineConfig {
        min_confidence: 50,
        ..PipelineConfig::default()
    };
    let mut harness = Harness::new(&modules, config).await;

    let guess = Event::derived("SUBDOMAIN", "maybe.example.com", "dns", &harness.target_event).with_confidence(10);
    let outcome = harness.pipeline.submit(guess).await;
    assert!(matches!(
        outcome,
        SubmitOutcome::Accepted {
            dispatched: 0,
            filtered: Some(FilterReason::LowConfidence),
            ..
        }
    ));
    assert!(harness.drain_work().is_empty());

    let stored = harness.events.events(harness.scan_id).await.unwrap();
    assert!(stored.iter().any(|e| e.data() == "maybe.example.com"));
}

#[tokio::test]
async fn test_bootstrapped_fingerprints_are_suppressed() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;
    let earlier = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    assert_eq!(harness.pipeline.bootstrap([earlier.fingerprint().clone()]), 1);

    let again = Event::derived("SUBDOMAIN", "www.example.com", "dns", &harness.target_event);
    assert!(harness.pipeline.submit(again).await.is_duplicate());
}

#[tokio::test]
async fn test_closed_pipeline_rejects_submissions() {
    let harness = Harness::new(&[], PipelineConfig::default()).await;
    harness.pipeline.close();

    let late = Event::derived("SUBDOMAIN", "late.example.com", "dns", &harness.target_event);
    let outcome = harness.pipeline.submit(late).await;
    assert!(matches!(outcome, SubmitOutcome::Rejected { reason: RejectReason::Closed }));
    assert!(harness.pipeline.is_drained());
}
