// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// In-memory event streaming over tokio broadcast channels. Feeds the CLI
// `--follow` output and any dashboard observer. Events are not persisted.

use crate::domain::events::{AutoUpdateEvent, StackEvent};
use crate::domain::stack::StackId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Stack(StackEvent),
    AutoUpdate(AutoUpdateEvent),
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Capacity is the number of buffered events before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_stack_event(&self, event: StackEvent) {
        self.publish(DomainEvent::Stack(event));
    }

    pub fn publish_update_event(&self, event: AutoUpdateEvent) {
        self.publish(DomainEvent::AutoUpdate(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() errors only when nobody is listening
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the stack events of a single stack
    pub fn subscribe_stack(&self, stack_id: StackId) -> StackEventReceiver {
        StackEventReceiver {
            receiver: self.sender.subscribe(),
            stack_id,
        }
    }

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

/// Receiver for one stack's events (filtered)
pub struct StackEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    stack_id: StackId,
}

impl StackEventReceiver {
    /// Next stack event for the subscribed stack. A rename away from the
    /// subscribed id is delivered too.
    pub async fn recv(&mut self) -> Result<StackEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Stack(stack_event) = event {
                if self.matches(&stack_event) {
                    return Ok(stack_event);
                }
            }
        }
    }

    fn matches(&self, event: &StackEvent) -> bool {
        match event {
            StackEvent::StackRenamed { old_id, new_id, .. } => {
                old_id == &self.stack_id || new_id == &self.stack_id
            }
            other => other.stack_id() == Some(&self.stack_id),
        }
    }
}

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
    use crate::domain::events::UpdateTarget;
    use chrono::Utc;

    fn id(s: &str) -> StackId {
        StackId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_stack_event(StackEvent::StackDeployed {
            stack_id: id("media"),
            service_count: 2,
            deployed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Stack(StackEvent::StackDeployed { stack_id, service_count, .. }) => {
                assert_eq!(stack_id, id("media"));
                assert_eq!(service_count, 2);
            }
            _ => panic!("Wrong event type received"),
        }
    }

    #[tokio::test]
    async fn test_stack_event_filtering() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_stack(id("media"));

        event_bus.publish_stack_event(StackEvent::StackStopped {
            stack_id: id("other"),
            removed_containers: 1,
            stopped_at: Utc::now(),
        });
        event_bus.publish_update_event(AutoUpdateEvent::UpdateFailed {
            target: UpdateTarget::Stack { id: id("media") },
            reason: "pull failed".to_string(),
            failed_at: Utc::now(),
        });
        event_bus.publish_stack_event(StackEvent::StackRenamed {
            old_id: id("media"),
            new_id: id("films"),
            renamed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            StackEvent::StackRenamed { old_id, new_id, .. } => {
                assert_eq!(old_id, id("media"));
                assert_eq!(new_id, id("films"));
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();
        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_stack_event(StackEvent::StackDeleted {
            stack_id: id("media"),
            deleted_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
        assert!(matches!(receiver1.try_recv(), Err(EventBusError::Empty)));
    }
}
