use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::message::MessageWrapper;
use crate::broker::{BrokerService, BrokerServiceLocator};
use crate::client::BrokerClient;
use crate::config::BrokerSettings;
use crate::persistence::{StateManager, TimeoutRetryHelper};
use crate::transport::{
    BrokerAddress, EndpointResolver, LocalCluster, LocalEndpoints, NamingService, PartitionKey,
    Subscriber,
};
use crate::utils::error::DeliveryError;

/// Subscriber that records what it receives, or rejects everything while
/// failing.
#[derive(Default)]
pub(crate) struct RecordingSubscriber {
    received: Mutex<Vec<MessageWrapper>>,
    failing: AtomicBool,
}

impl RecordingSubscriber {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        let subscriber = Self::default();
        subscriber.failing.store(true, Ordering::SeqCst);
        Arc::new(subscriber)
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn received(&self) -> Vec<MessageWrapper> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn payloads(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|message| message.payload().to_string())
            .collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn receive_message(&self, message: MessageWrapper) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::rejected("subscriber unavailable"));
        }
        self.received.lock().unwrap().push(message);
        Ok(())
    }
}

/// Subscriber whose deliveries never complete.
pub(crate) struct HangingSubscriber;

#[async_trait]
impl Subscriber for HangingSubscriber {
    async fn receive_message(&self, _message: MessageWrapper) -> Result<(), DeliveryError> {
        std::future::pending().await
    }
}

/// Settings with no start delay, a short period and a throttle of 2.
pub(crate) fn fast_settings() -> BrokerSettings {
    BrokerSettings {
        broker_name: "test-broker".to_string(),
        due_time_ms: 0,
        period_ms: 10,
        max_processing_period_ms: 2_000,
        max_dequeues_in_one_iteration: 100,
        throttle_factor: 2,
        force_unordered: false,
    }
}

pub(crate) fn fast_retry() -> TimeoutRetryHelper {
    TimeoutRetryHelper::new(5, Duration::from_millis(5))
}

pub(crate) fn memory_state() -> StateManager {
    StateManager::in_memory(Duration::from_millis(250))
}

pub(crate) fn broker_with(
    state: StateManager,
    resolver: Arc<dyn EndpointResolver>,
    settings: BrokerSettings,
) -> BrokerService {
    BrokerService::new(state, resolver, settings).with_retry_helper(fast_retry())
}

/// Several in-memory partitions of one broker, hosted in a `LocalCluster`.
pub(crate) struct TestCluster {
    pub cluster: Arc<LocalCluster>,
    pub endpoints: Arc<LocalEndpoints>,
    pub address: BrokerAddress,
    pub partitions: Vec<(PartitionKey, Arc<BrokerService>)>,
}

impl TestCluster {
    /// `count` partitions keyed `0..count`, not yet registered by name.
    pub(crate) fn new(count: i64) -> Self {
        let cluster = Arc::new(LocalCluster::new());
        let endpoints = Arc::new(LocalEndpoints::new());
        let address = BrokerAddress::new("local://test-broker");
        let partitions = (0..count)
            .map(|key| {
                let broker = Arc::new(broker_with(memory_state(), endpoints.clone(), fast_settings()));
                cluster.add_partition(&address, PartitionKey::Int64(key), broker.clone());
                (PartitionKey::Int64(key), broker)
            })
            .collect();
        Self {
            cluster,
            endpoints,
            address,
            partitions,
        }
    }

    pub(crate) async fn register(&self) {
        self.cluster
            .register(&fast_settings().broker_name, self.address.clone())
            .await
            .unwrap();
    }

    pub(crate) fn client(&self) -> BrokerClient {
        let locator = BrokerServiceLocator::new(self.cluster.clone(), fast_settings().broker_name);
        BrokerClient::new(Arc::new(locator), self.cluster.clone())
    }

    pub(crate) fn partition(&self, key: &PartitionKey) -> Arc<BrokerService> {
        self.partitions
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, broker)| broker.clone())
            .unwrap()
    }
}
