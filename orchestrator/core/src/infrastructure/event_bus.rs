// Copyright (c) 2026 Argus Contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory fan-out of scan lifecycle, pipeline and work-item records using
// tokio broadcast channels. Feeds the CLI live view and any embedding
// observer. Events are not retained; slow receivers lag.

use crate::domain::events::{PipelineEvent, ScanLifecycleEvent, WorkEvent};
use crate::domain::scan::ScanId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Scan(ScanLifecycleEvent),
    Pipeline(PipelineEvent),
    Work(WorkEvent),
}

impl DomainEvent {
    pub fn scan_id(&self) -> ScanId {
        match self {
            DomainEvent::Scan(event) => event.scan_id(),
            DomainEvent::Pipeline(event) => event.scan_id(),
            DomainEvent::Work(event) => event.scan_id(),
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Capacity is how many events are buffered before the oldest are dropped
    /// for lagging receivers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    pub fn publish_scan_event(&self, event: ScanLifecycleEvent) {
        self.publish(DomainEvent::Scan(event));
    }

    pub fn publish_pipeline_event(&self, event: PipelineEvent) {
        self.publish(DomainEvent::Pipeline(event));
    }

    pub fn publish_work_event(&self, event: WorkEvent) {
        self.publish(DomainEvent::Work(event));
    }

    fn publish(&self, event: DomainEvent) {
        trace!(?event, "Publishing domain event");

        // send() only fails when there are no receivers
        if self.sender.send(event).is_err() {
            trace!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single scan
    pub fn subscribe_scan(&self, scan_id: ScanId) -> ScanEventReceiver {
        ScanEventReceiver {
            receiver: self.sender.subscribe(),
            scan_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to one scan
pub struct ScanEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    scan_id: ScanId,
}

impl ScanEventReceiver {
    /// Next event belonging to this receiver's scan; others are skipped.
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.scan_id() == self.scan_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scan::{ScanPriority, ScanState};
    use chrono::Utc;

    fn queued(scan_id: ScanId) -> ScanLifecycleEvent {
        ScanLifecycleEvent::ScanQueued {
            scan_id,
            priority: ScanPriority::Normal,
            queue_depth: 1,
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let scan_id = ScanId::new();
        event_bus.publish_scan_event(queued(scan_id));

        match receiver.recv().await.unwrap() {
            DomainEvent::Scan(ScanLifecycleEvent::ScanQueued { scan_id: id, .. }) => assert_eq!(id, scan_id),
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scan_event_filtering() {
        let event_bus = EventBus::new(10);
        let scan_id = ScanId::new();
        let mut receiver = event_bus.subscribe_scan(scan_id);

        event_bus.publish_scan_event(queued(ScanId::new()));
        event_bus.publish_scan_event(ScanLifecycleEvent::ScanStateChanged {
            scan_id,
            from: ScanState::Created,
            to: ScanState::Starting,
            reason: None,
            changed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Scan(ScanLifecycleEvent::ScanStateChanged { scan_id: id, to, .. }) => {
                assert_eq!(id, scan_id);
                assert_eq!(to, ScanState::Starting);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_scan_event(queued(ScanId::new()));

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
