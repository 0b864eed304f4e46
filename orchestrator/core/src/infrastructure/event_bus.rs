// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Network Events
//
// In-memory event streaming over a tokio broadcast channel. Publishing never
// blocks and never fails: with no subscribers the event is dropped, and slow
// subscribers lose the oldest events once the buffer is full.

use crate::domain::events::NetworkEvent;
use crate::domain::service::ServiceName;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to network events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<NetworkEvent>>,
}

impl EventBus {
    /// Capacity is the number of events buffered per subscriber before the
    /// oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_network_event(&self, event: NetworkEvent) {
        debug!("Publishing event: {:?}", event);
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events that concern one service.
    pub fn subscribe_service(&self, service_name: ServiceName) -> ServiceEventReceiver {
        ServiceEventReceiver {
            receiver: self.sender.subscribe(),
            service_name,
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

pub struct EventReceiver {
    receiver: broadcast::Receiver<NetworkEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<NetworkEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<NetworkEvent, EventBusError> {
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

/// Receiver filtered to events naming a single service
pub struct ServiceEventReceiver {
    receiver: broadcast::Receiver<NetworkEvent>,
    service_name: ServiceName,
}

impl ServiceEventReceiver {
    pub async fn recv(&mut self) -> Result<NetworkEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.service_names().contains(&&self.service_name) {
                return Ok(event);
            }
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
