//! Broker lifecycle events and per-queue counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::broker::message::MessageWrapper;
use crate::broker::reference::ReferenceWrapper;
use crate::utils::error::DeliveryError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Counters of one subscription queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub service_name: String,
    /// Time of the last update.
    pub time: DateTime<Utc>,
    pub total_received: u64,
    pub total_delivered: u64,
    pub total_delivery_failures: u64,
}

impl QueueStats {
    pub fn new(queue_name: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            service_name: service_name.into(),
            time: Utc::now(),
            total_received: 0,
            total_delivered: 0,
            total_delivery_failures: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerEvent {
    /// The partition rebuilt its subscription index from storage.
    Initialized {
        subscriptions: usize,
    },
    Subscribed {
        queue_name: String,
        subscriber: String,
        message_type: String,
    },
    Unsubscribed {
        queue_name: String,
        subscriber: String,
        message_type: String,
    },
    MessagePublished {
        message_type: String,
    },
    MessageQueued {
        queue_name: String,
        subscriber: String,
        message_type: String,
    },
    MessageDelivered {
        queue_name: String,
        subscriber: String,
        message_type: String,
    },
    MessageDeliveryFailed {
        queue_name: String,
        subscriber: String,
        message_type: String,
        error: String,
        throttle: u32,
    },
}

/// Observer of everything the engine does.
#[async_trait]
pub trait BrokerEventsManager: Send + Sync {
    async fn on_initialized(&self, _subscriptions: usize) {}

    async fn on_subscribed(&self, queue_name: &str, reference: &ReferenceWrapper, message_type: &str);

    async fn on_unsubscribed(&self, queue_name: &str, reference: &ReferenceWrapper, message_type: &str);

    async fn on_message_published(&self, message: &MessageWrapper);

    async fn on_message_queued_to_subscriber(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
    );

    async fn on_message_delivered(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
    );

    async fn on_message_delivery_failed(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
        error: &DeliveryError,
        throttle: u32,
    );

    async fn get_stats(&self) -> Vec<QueueStats>;
}

/// In-memory stats table that also rebroadcasts every event.
pub struct DefaultBrokerEventsManager {
    stats: DashMap<String, QueueStats>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Default for DefaultBrokerEventsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultBrokerEventsManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            stats: DashMap::new(),
            events,
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn update(&self, queue_name: &str, reference: &ReferenceWrapper, apply: impl FnOnce(&mut QueueStats)) {
        let mut entry = self
            .stats
            .entry(queue_name.to_string())
            .or_insert_with(|| QueueStats::new(queue_name, reference.name()));
        apply(&mut *entry);
        entry.time = Utc::now();
    }
}

#[async_trait]
impl BrokerEventsManager for DefaultBrokerEventsManager {
    async fn on_initialized(&self, subscriptions: usize) {
        self.emit(BrokerEvent::Initialized { subscriptions });
    }

    async fn on_subscribed(&self, queue_name: &str, reference: &ReferenceWrapper, message_type: &str) {
        self.update(queue_name, reference, |_| {});
        self.emit(BrokerEvent::Subscribed {
            queue_name: queue_name.to_string(),
            subscriber: reference.name(),
            message_type: message_type.to_string(),
        });
    }

    async fn on_unsubscribed(&self, queue_name: &str, reference: &ReferenceWrapper, message_type: &str) {
        self.stats.remove(queue_name);
        self.emit(BrokerEvent::Unsubscribed {
            queue_name: queue_name.to_string(),
            subscriber: reference.name(),
            message_type: message_type.to_string(),
        });
    }

    async fn on_message_published(&self, message: &MessageWrapper) {
        self.emit(BrokerEvent::MessagePublished {
            message_type: message.message_type().to_string(),
        });
    }

    async fn on_message_queued_to_subscriber(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
    ) {
        self.update(queue_name, reference, |stats| stats.total_received += 1);
        self.emit(BrokerEvent::MessageQueued {
            queue_name: queue_name.to_string(),
            subscriber: reference.name(),
            message_type: message.message_type().to_string(),
        });
    }

    async fn on_message_delivered(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
    ) {
        self.update(queue_name, reference, |stats| stats.total_delivered += 1);
        self.emit(BrokerEvent::MessageDelivered {
            queue_name: queue_name.to_string(),
            subscriber: reference.name(),
            message_type: message.message_type().to_string(),
        });
    }

    async fn on_message_delivery_failed(
        &self,
        queue_name: &str,
        reference: &ReferenceWrapper,
        message: &MessageWrapper,
        error: &DeliveryError,
        throttle: u32,
    ) {
        self.update(queue_name, reference, |stats| {
            stats.total_delivery_failures += 1
        });
        self.emit(BrokerEvent::MessageDeliveryFailed {
            queue_name: queue_name.to_string(),
            subscriber: reference.name(),
            message_type: message.message_type().to_string(),
            error: error.to_string(),
            throttle,
        });
    }

    async fn get_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self.stats.iter().map(|entry| entry.value().clone()).collect();
        stats.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        stats
    }
}
