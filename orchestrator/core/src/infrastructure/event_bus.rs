// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory fan-out of sequence lifecycle events and correlation failures
// using tokio broadcast channels. Subscribers that fall behind lose the
// oldest events; nothing is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::lifecycle::SequenceLifecycleEvent;

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Lifecycle(SequenceLifecycleEvent),
    /// An inbound started/finished event had no prior-phase counterpart
    CorrelationFailed {
        event_id: String,
        event_type: String,
        keptn_context: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn keptn_context(&self) -> &str {
        match self {
            DomainEvent::Lifecycle(event) => event.keptn_context(),
            DomainEvent::CorrelationFailed { keptn_context, .. } => keptn_context,
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_lifecycle_event(&self, event: SequenceLifecycleEvent) {
        self.publish(DomainEvent::Lifecycle(event));
    }

    pub fn publish_correlation_failure(
        &self,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        keptn_context: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.publish(DomainEvent::CorrelationFailed {
            event_id: event_id.into(),
            event_type: event_type.into(),
            keptn_context: keptn_context.into(),
            reason: reason.into(),
            failed_at: Utc::now(),
        });
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        let receiver = self.sender.subscribe();
        EventReceiver { receiver }
    }

    /// Subscribe to the events of a single sequence run
    pub fn subscribe_context(&self, keptn_context: impl Into<String>) -> ContextEventReceiver {
        let receiver = self.sender.subscribe();
        ContextEventReceiver {
            receiver,
            keptn_context: keptn_context.into(),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
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

/// Receiver filtered to one keptn context
pub struct ContextEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    keptn_context: String,
}

impl ContextEventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.keptn_context() == self.keptn_context {
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

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event_scope::EventScope;

    fn paused(ctx: &str) -> SequenceLifecycleEvent {
        SequenceLifecycleEvent::SequencePaused(EventScope {
            project: "sockshop".to_string(),
            stage: "dev".to_string(),
            service: "carts".to_string(),
            keptn_context: ctx.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_lifecycle_event(paused("ctx-1"));

        match receiver.recv().await.unwrap() {
            DomainEvent::Lifecycle(SequenceLifecycleEvent::SequencePaused(scope)) => {
                assert_eq!(scope.keptn_context, "ctx-1");
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_context_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_context("ctx-2");

        event_bus.publish_lifecycle_event(paused("ctx-1"));
        event_bus.publish_correlation_failure("e1", "sh.keptn.event.test.started", "ctx-2", "no triggered event");

        match receiver.recv().await.unwrap() {
            DomainEvent::CorrelationFailed { event_id, .. } => assert_eq!(event_id, "e1"),
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_lifecycle_event(paused("ctx-1"));

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }

    #[test]
    fn test_try_recv_empty() {
        let event_bus = EventBus::new(4);
        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
