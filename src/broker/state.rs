use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::reference::ReferenceWrapper;
use crate::broker::subscription::SubscriptionDetails;

/// Subscriber directory of one message type.
///
/// Values are never mutated in place: `add_subscriber` and `remove_subscriber`
/// return a new directory sharing nothing mutable with the old one, and the
/// engine replaces the stored value inside a transaction. Subscribers keep
/// the order they subscribed in, and no subscriber identity appears twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerServiceState {
    pub message_type_name: String,
    subscribers: Arc<Vec<SubscriptionDetails>>,
}

impl BrokerServiceState {
    pub fn new(message_type_name: impl Into<String>) -> Self {
        Self {
            message_type_name: message_type_name.into(),
            subscribers: Arc::new(Vec::new()),
        }
    }

    pub fn subscribers(&self) -> &[SubscriptionDetails] {
        &self.subscribers
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn find(&self, reference: &ReferenceWrapper) -> Option<&SubscriptionDetails> {
        self.subscribers
            .iter()
            .find(|details| &details.reference == reference)
    }

    pub fn contains(&self, reference: &ReferenceWrapper) -> bool {
        self.find(reference).is_some()
    }

    /// Directory with `details` appended; unchanged when the subscriber is
    /// already present.
    pub fn add_subscriber(&self, details: SubscriptionDetails) -> Self {
        if self.contains(&details.reference) {
            return self.clone();
        }
        let mut subscribers = Vec::with_capacity(self.subscribers.len() + 1);
        subscribers.extend(self.subscribers.iter().cloned());
        subscribers.push(details);
        Self {
            message_type_name: self.message_type_name.clone(),
            subscribers: Arc::new(subscribers),
        }
    }

    pub fn remove_subscriber(&self, reference: &ReferenceWrapper) -> Self {
        if !self.contains(reference) {
            return self.clone();
        }
        let subscribers = self
            .subscribers
            .iter()
            .filter(|details| &details.reference != reference)
            .cloned()
            .collect();
        Self {
            message_type_name: self.message_type_name.clone(),
            subscribers: Arc::new(subscribers),
        }
    }
}
