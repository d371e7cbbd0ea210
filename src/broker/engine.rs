use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::api::{BrokerApi, BrokerStats};
use crate::broker::delivery::DeliveryLoop;
use crate::broker::events::{BrokerEventsManager, DefaultBrokerEventsManager};
use crate::broker::message::MessageWrapper;
use crate::broker::reference::ReferenceWrapper;
use crate::broker::state::BrokerServiceState;
use crate::broker::subscription::{Subscription, SubscriptionDetails, SubscriptionFactory};
use crate::config::{BrokerSettings, Settings};
use crate::persistence::{StateManager, StoreError, TimeoutRetryHelper};
use crate::transport::EndpointResolver;
use crate::utils::error::{BrokerError, BrokerResult, DeliveryError};

/// Dictionary holding one `BrokerServiceState` per message type.
pub const BROKER_STATE_DICTIONARY: &str = "broker_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Outcome of one delivery pass over all subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryPass {
    /// Subscriptions drained during the pass.
    pub processed: usize,
    /// Subscriptions skipped because they are being throttled.
    pub throttled: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SubscriptionOutcome {
    delivered: usize,
    failed: bool,
}

/// The broker partition: owner of the subscription directory of every message
/// type hashed to it, and of the queues behind those subscriptions.
///
/// The first call into the service rebuilds the in-memory subscription index
/// from storage; every public operation waits for that to finish.
pub struct BrokerService {
    state: StateManager,
    settings: BrokerSettings,
    retry: TimeoutRetryHelper,
    events: Arc<dyn BrokerEventsManager>,
    resolver: Arc<dyn EndpointResolver>,
    /// Queue name to subscription.
    subscriptions: DashMap<String, Arc<dyn Subscription>>,
    init_gate: Semaphore,
    lifecycle: watch::Sender<EngineState>,
}

impl BrokerService {
    pub fn new(
        state: StateManager,
        resolver: Arc<dyn EndpointResolver>,
        settings: BrokerSettings,
    ) -> Self {
        let (lifecycle, _) = watch::channel(EngineState::Uninitialized);
        Self {
            state,
            settings,
            retry: TimeoutRetryHelper::default(),
            events: Arc::new(DefaultBrokerEventsManager::new()),
            resolver,
            subscriptions: DashMap::new(),
            init_gate: Semaphore::new(1),
            lifecycle,
        }
    }

    /// A broker that queues every subscription unordered, whatever the
    /// subscriber asked for.
    pub fn unordered(
        state: StateManager,
        resolver: Arc<dyn EndpointResolver>,
        mut settings: BrokerSettings,
    ) -> Self {
        settings.force_unordered = true;
        Self::new(state, resolver, settings)
    }

    pub fn from_settings(
        settings: &Settings,
        resolver: Arc<dyn EndpointResolver>,
    ) -> BrokerResult<Self> {
        let state = StateManager::from_settings(&settings.storage)?;
        Ok(Self::new(state, resolver, settings.broker.clone())
            .with_retry_helper(TimeoutRetryHelper::from_settings(&settings.retry)))
    }

    pub fn with_events_manager(mut self, events: Arc<dyn BrokerEventsManager>) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_helper(mut self, retry: TimeoutRetryHelper) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    pub fn engine_state(&self) -> EngineState {
        *self.lifecycle.borrow()
    }

    /// Resolves once initialization has completed.
    pub async fn wait_until_ready(&self) {
        let mut lifecycle = self.lifecycle.subscribe();
        let _ = lifecycle.wait_for(|state| *state == EngineState::Ready).await;
    }

    pub fn subscription(&self, queue_name: &str) -> Option<Arc<dyn Subscription>> {
        self.subscriptions
            .get(queue_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Spawn the delivery loop of this partition.
    pub fn start(self: &Arc<Self>) -> DeliveryLoop {
        DeliveryLoop::spawn(Arc::clone(self))
    }

    /// Run initialization once; concurrent callers wait for the first run.
    pub async fn ensure_initialized(&self) -> BrokerResult<()> {
        if self.engine_state() == EngineState::Ready {
            return Ok(());
        }

        let _permit = self
            .init_gate
            .acquire()
            .await
            .map_err(|_| StoreError::Cancelled)?;
        if self.engine_state() == EngineState::Ready {
            return Ok(());
        }

        self.lifecycle.send_replace(EngineState::Initializing);
        match self.initialize().await {
            Ok(count) => {
                self.lifecycle.send_replace(EngineState::Ready);
                info!(subscriptions = count, "broker partition ready");
                self.events.on_initialized(count).await;
                Ok(())
            }
            Err(err) => {
                self.lifecycle.send_replace(EngineState::Uninitialized);
                error!("broker initialization failed: {err}");
                Err(err)
            }
        }
    }

    async fn initialize(&self) -> BrokerResult<usize> {
        let directories = self
            .retry
            .execute_in_transaction(&self.state, |tx| async move {
                let mut directories = Vec::new();
                for key in tx.keys(BROKER_STATE_DICTIONARY)? {
                    if let Some(directory) =
                        tx.get::<BrokerServiceState>(BROKER_STATE_DICTIONARY, &key)?
                    {
                        directories.push(directory);
                    }
                }
                Ok::<_, BrokerError>(directories)
            })
            .await?;

        self.subscriptions.clear();
        for directory in &directories {
            for details in directory.subscribers() {
                let subscription = SubscriptionFactory::create(&self.state, details.clone())?;
                self.subscriptions
                    .insert(details.queue_name.clone(), subscription);
            }
        }
        Ok(self.subscriptions.len())
    }

    /// Subscribe `reference` to `message_type_name`. Subscribing an already
    /// subscribed reference changes nothing.
    pub async fn subscribe(
        &self,
        reference: ReferenceWrapper,
        message_type_name: &str,
        is_ordered: bool,
    ) -> BrokerResult<()> {
        self.ensure_initialized().await?;

        let is_ordered = is_ordered && !self.settings.force_unordered;
        let details = SubscriptionDetails::new(reference, message_type_name, is_ordered);
        if self.subscriptions.contains_key(&details.queue_name) {
            debug!(
                subscriber = %details.reference,
                message_type = message_type_name,
                "already subscribed"
            );
            return Ok(());
        }

        // The queue and the index entry exist before the directory points at them.
        let subscription = SubscriptionFactory::create(&self.state, details.clone())?;
        self.subscriptions
            .insert(details.queue_name.clone(), subscription);
        let added = self
            .retry
            .execute_in_transaction(&self.state, |tx| {
                let details = details.clone();
                async move {
                    let directory = tx
                        .get_for_update::<BrokerServiceState>(
                            BROKER_STATE_DICTIONARY,
                            &details.message_type_name,
                        )
                        .await?
                        .unwrap_or_else(|| BrokerServiceState::new(details.message_type_name.clone()));
                    if directory.contains(&details.reference) {
                        return Ok(false);
                    }
                    let updated = directory.add_subscriber(details.clone());
                    tx.set(BROKER_STATE_DICTIONARY, &details.message_type_name, &updated)
                        .await?;
                    Ok::<_, BrokerError>(true)
                }
            })
            .await;
        let added = match added {
            Ok(added) => added,
            Err(err) => {
                self.subscriptions.remove(&details.queue_name);
                return Err(err);
            }
        };

        if added {
            info!(
                subscriber = %details.reference,
                message_type = message_type_name,
                queue = %details.queue_name,
                ordered = is_ordered,
                "subscribed"
            );
            self.events
                .on_subscribed(&details.queue_name, &details.reference, message_type_name)
                .await;
        }
        Ok(())
    }

    /// Remove the subscription and delete its queue, including anything
    /// still waiting in it.
    pub async fn unsubscribe(
        &self,
        reference: &ReferenceWrapper,
        message_type_name: &str,
    ) -> BrokerResult<()> {
        self.ensure_initialized().await?;

        let removed = self
            .retry
            .execute_in_transaction(&self.state, |tx| async move {
                let Some(directory) = tx
                    .get_for_update::<BrokerServiceState>(BROKER_STATE_DICTIONARY, message_type_name)
                    .await?
                else {
                    return Ok(None);
                };
                let Some(details) = directory.find(reference).cloned() else {
                    return Ok(None);
                };

                let updated = directory.remove_subscriber(reference);
                if updated.is_empty() {
                    tx.remove(BROKER_STATE_DICTIONARY, message_type_name).await?;
                } else {
                    tx.set(BROKER_STATE_DICTIONARY, message_type_name, &updated)
                        .await?;
                }
                tx.drop_queue(&details.queue_name).await?;
                Ok::<_, BrokerError>(Some(details))
            })
            .await?;

        let Some(details) = removed else {
            debug!(
                subscriber = %reference,
                message_type = message_type_name,
                "not subscribed"
            );
            return Ok(());
        };

        self.subscriptions.remove(&details.queue_name);
        info!(
            subscriber = %reference,
            message_type = message_type_name,
            queue = %details.queue_name,
            "unsubscribed"
        );
        self.events
            .on_unsubscribed(&details.queue_name, reference, message_type_name)
            .await;
        Ok(())
    }

    /// Queue `message` for every subscriber of its type, all or nothing.
    pub async fn publish_message(&self, message: MessageWrapper) -> BrokerResult<()> {
        self.ensure_initialized().await?;
        self.events.on_message_published(&message).await;

        let message = &message;
        let queued = self
            .retry
            .execute_in_transaction(&self.state, |tx| async move {
                // Holding the entry keeps subscribe and unsubscribe out until commit.
                let Some(directory) = tx
                    .get_for_update::<BrokerServiceState>(
                        BROKER_STATE_DICTIONARY,
                        message.message_type(),
                    )
                    .await?
                else {
                    return Ok(Vec::new());
                };

                let mut queued = Vec::with_capacity(directory.len());
                for details in directory.subscribers() {
                    let Some(subscription) = self.subscription(&details.queue_name) else {
                        warn!(
                            subscriber = %details.reference,
                            queue = %details.queue_name,
                            "subscriber listed without a subscription, skipped"
                        );
                        continue;
                    };
                    subscription.enqueue_message(&tx, message).await?;
                    queued.push(subscription);
                }
                Ok::<_, BrokerError>(queued)
            })
            .await?;

        if queued.is_empty() {
            debug!(message_type = message.message_type(), "no subscribers");
            return Ok(());
        }

        debug!(
            message_type = message.message_type(),
            subscribers = queued.len(),
            "message queued"
        );
        for subscription in &queued {
            self.events
                .on_message_queued_to_subscriber(
                    subscription.queue_name(),
                    subscription.reference(),
                    message,
                )
                .await;
        }
        Ok(())
    }

    pub async fn get_broker_stats(&self) -> BrokerResult<BrokerStats> {
        self.ensure_initialized().await?;

        let queues: BTreeMap<String, ReferenceWrapper> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().reference().clone()))
            .collect();
        Ok(BrokerStats {
            queues,
            stats: self.events.get_stats().await,
        })
    }

    /// Drain every subscription that is not being throttled, concurrently.
    /// Errors of individual subscriptions are logged, never returned.
    pub async fn run_delivery_pass(&self, cancel: &CancellationToken) -> BrokerResult<DeliveryPass> {
        self.ensure_initialized().await?;

        let subscriptions: Vec<Arc<dyn Subscription>> = self
            .subscriptions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut pass = DeliveryPass::default();
        let mut due = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            if subscription.reference().should_process_messages() {
                due.push(subscription);
            } else {
                pass.throttled += 1;
                debug!(
                    subscriber = %subscription.reference(),
                    remaining = subscription.reference().skip_count(),
                    "subscriber throttled"
                );
            }
        }
        pass.processed = due.len();

        let results = join_all(
            due.iter()
                .map(|subscription| self.process_subscription(subscription.as_ref(), cancel)),
        )
        .await;

        for (subscription, result) in due.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    pass.delivered += outcome.delivered;
                    if outcome.failed {
                        pass.failed += 1;
                    }
                }
                Err(BrokerError::Store(StoreError::Cancelled)) => {
                    debug!(queue = subscription.queue_name(), "delivery cancelled")
                }
                Err(BrokerError::Store(StoreError::QueueNotFound { .. })) => {
                    debug!(queue = subscription.queue_name(), "queue removed during delivery")
                }
                Err(err) => error!(queue = subscription.queue_name(), "delivery failed: {err}"),
            }
        }
        Ok(pass)
    }

    async fn process_subscription(
        &self,
        subscription: &dyn Subscription,
        cancel: &CancellationToken,
    ) -> BrokerResult<SubscriptionOutcome> {
        let mut outcome = SubscriptionOutcome::default();
        let budget = subscription
            .queue_count()?
            .min(self.settings.max_dequeues_in_one_iteration);

        for _ in 0..budget {
            if cancel.is_cancelled() {
                break;
            }

            let result = self
                .retry
                .execute_in_transaction(&self.state, |tx| async move {
                    let Some(message) = subscription.dequeue_message(&tx, cancel).await? else {
                        return Ok(None);
                    };
                    if let Err(source) = subscription
                        .deliver_message(&message, self.resolver.as_ref())
                        .await
                    {
                        self.on_delivery_failure(subscription, &message, &source)
                            .await;
                        return Err(BrokerError::Delivery {
                            subscriber: subscription.reference().name(),
                            source,
                        });
                    }
                    Ok::<_, BrokerError>(Some(message))
                })
                .await;

            match result {
                Ok(Some(message)) => {
                    outcome.delivered += 1;
                    self.events
                        .on_message_delivered(
                            subscription.queue_name(),
                            subscription.reference(),
                            &message,
                        )
                        .await;
                }
                Ok(None) => break,
                // The transaction was aborted, so the message stays at the head.
                Err(BrokerError::Delivery { .. }) => {
                    outcome.failed = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    async fn on_delivery_failure(
        &self,
        subscription: &dyn Subscription,
        message: &MessageWrapper,
        source: &DeliveryError,
    ) {
        let throttle = self.settings.throttle_factor;
        subscription.reference().set_skip_count(throttle);
        warn!(
            subscriber = %subscription.reference(),
            queue = subscription.queue_name(),
            message_type = message.message_type(),
            throttle,
            "delivery failed: {source}"
        );
        self.events
            .on_message_delivery_failed(
                subscription.queue_name(),
                subscription.reference(),
                message,
                source,
                throttle,
            )
            .await;
    }
}

impl fmt::Debug for BrokerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerService")
            .field("state", &self.engine_state())
            .field("subscriptions", &self.subscriptions.len())
            .field("force_unordered", &self.settings.force_unordered)
            .finish()
    }
}

#[async_trait]
impl BrokerApi for BrokerService {
    async fn subscribe(
        &self,
        reference: ReferenceWrapper,
        message_type_name: &str,
        is_ordered: bool,
    ) -> BrokerResult<()> {
        BrokerService::subscribe(self, reference, message_type_name, is_ordered).await
    }

    async fn unsubscribe(&self, reference: &ReferenceWrapper, message_type_name: &str)
    -> BrokerResult<()> {
        BrokerService::unsubscribe(self, reference, message_type_name).await
    }

    async fn publish_message(&self, message: MessageWrapper) -> BrokerResult<()> {
        BrokerService::publish_message(self, message).await
    }

    async fn get_broker_stats(&self) -> BrokerResult<BrokerStats> {
        BrokerService::get_broker_stats(self).await
    }
}
