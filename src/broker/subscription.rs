//! Per-(message type, subscriber) queues.
//!
//! Every subscription owns one durable queue named after a hash of the message
//! type and the subscriber identity, so subscribing the same pair twice always
//! lands on the same queue.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::broker::message::MessageWrapper;
use crate::broker::reference::ReferenceWrapper;
use crate::persistence::{
    ReliableConcurrentQueue, ReliableQueue, StateManager, StoreResult, Transaction,
};
use crate::transport::EndpointResolver;
use crate::utils::error::DeliveryError;
use crate::utils::hashing::stable_hash;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub reference: ReferenceWrapper,
    pub message_type_name: String,
    pub is_ordered: bool,
    pub queue_name: String,
}

impl SubscriptionDetails {
    pub fn new(
        reference: ReferenceWrapper,
        message_type_name: impl Into<String>,
        is_ordered: bool,
    ) -> Self {
        let message_type_name = message_type_name.into();
        let queue_name = Self::queue_name_for(&reference, &message_type_name);
        Self {
            reference,
            message_type_name,
            is_ordered,
            queue_name,
        }
    }

    /// `hash(message_type_name + hash(reference))`
    pub fn queue_name_for(reference: &ReferenceWrapper, message_type_name: &str) -> String {
        let reference_hash = stable_hash(&reference.identity_key());
        stable_hash(&format!("{message_type_name}{reference_hash}")).to_string()
    }
}

// Two details are the same subscription when they bind the same subscriber to
// the same message type.
impl PartialEq for SubscriptionDetails {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference && self.message_type_name == other.message_type_name
    }
}

impl Eq for SubscriptionDetails {}

#[async_trait]
pub trait Subscription: Send + Sync + fmt::Debug {
    fn details(&self) -> &SubscriptionDetails;

    async fn enqueue_message(&self, tx: &Transaction, message: &MessageWrapper) -> StoreResult<()>;

    /// Next message to deliver, or `None` when the queue is drained. The
    /// message only leaves the queue if `tx` commits.
    async fn dequeue_message(
        &self,
        tx: &Transaction,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<MessageWrapper>>;

    fn queue_count(&self) -> StoreResult<usize>;

    fn reference(&self) -> &ReferenceWrapper {
        &self.details().reference
    }

    fn queue_name(&self) -> &str {
        &self.details().queue_name
    }

    async fn deliver_message(
        &self,
        message: &MessageWrapper,
        resolver: &dyn EndpointResolver,
    ) -> Result<(), DeliveryError> {
        self.reference().publish(message, resolver).await
    }
}

/// Strict FIFO delivery; one transaction at a time drains the queue.
#[derive(Debug)]
pub struct OrderedSubscription {
    details: SubscriptionDetails,
    queue: ReliableQueue<MessageWrapper>,
}

#[async_trait]
impl Subscription for OrderedSubscription {
    fn details(&self) -> &SubscriptionDetails {
        &self.details
    }

    async fn enqueue_message(&self, tx: &Transaction, message: &MessageWrapper) -> StoreResult<()> {
        self.queue.enqueue(tx, message).await
    }

    async fn dequeue_message(
        &self,
        tx: &Transaction,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<MessageWrapper>> {
        self.queue.dequeue(tx, cancel).await
    }

    fn queue_count(&self) -> StoreResult<usize> {
        self.queue.count()
    }
}

/// Delivery in no particular order.
#[derive(Debug)]
pub struct UnorderedSubscription {
    details: SubscriptionDetails,
    queue: ReliableConcurrentQueue<MessageWrapper>,
}

#[async_trait]
impl Subscription for UnorderedSubscription {
    fn details(&self) -> &SubscriptionDetails {
        &self.details
    }

    async fn enqueue_message(&self, tx: &Transaction, message: &MessageWrapper) -> StoreResult<()> {
        self.queue.enqueue(tx, message).await
    }

    async fn dequeue_message(
        &self,
        tx: &Transaction,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<MessageWrapper>> {
        self.queue.dequeue(tx, cancel).await
    }

    fn queue_count(&self) -> StoreResult<usize> {
        self.queue.count()
    }
}

pub struct SubscriptionFactory;

impl SubscriptionFactory {
    /// Build the subscription for `details`, creating its queue if needed.
    pub fn create(
        state: &StateManager,
        details: SubscriptionDetails,
    ) -> StoreResult<Arc<dyn Subscription>> {
        if details.is_ordered {
            let queue = state.get_or_add_queue(&details.queue_name)?;
            Ok(Arc::new(OrderedSubscription { details, queue }))
        } else {
            let queue = state.get_or_add_concurrent_queue(&details.queue_name)?;
            Ok(Arc::new(UnorderedSubscription { details, queue }))
        }
    }
}
