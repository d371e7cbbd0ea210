//! In-process hosting: subscribers and broker partitions registered by hand.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{BrokerAddress, BrokerConnector, EndpointResolver, NamingService, PartitionKey, Subscriber};
use crate::broker::BrokerApi;
use crate::broker::reference::{ReferenceWrapper, SubscriberRef};
use crate::utils::error::{BrokerError, BrokerResult, DeliveryError};

/// Subscriber endpoints living in this process.
#[derive(Default)]
pub struct LocalEndpoints {
    endpoints: DashMap<SubscriberRef, Arc<dyn Subscriber>>,
}

impl LocalEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route deliveries addressed to `reference` to `subscriber`, replacing any
    /// previous registration.
    pub fn register(&self, reference: &ReferenceWrapper, subscriber: Arc<dyn Subscriber>) {
        debug!(subscriber = %reference, "endpoint registered");
        self.endpoints.insert(reference.target().clone(), subscriber);
    }

    pub fn remove(&self, reference: &ReferenceWrapper) -> bool {
        self.endpoints.remove(reference.target()).is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[async_trait]
impl EndpointResolver for LocalEndpoints {
    async fn resolve(&self, target: &SubscriberRef) -> Result<Arc<dyn Subscriber>, DeliveryError> {
        self.endpoints
            .get(target)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DeliveryError::EndpointNotFound {
                target: target.name(),
            })
    }
}

/// Broker names, addresses and partitions of this process.
#[derive(Default)]
pub struct LocalCluster {
    names: DashMap<String, BrokerAddress>,
    partitions: DashMap<BrokerAddress, BTreeMap<PartitionKey, Arc<dyn BrokerApi>>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `broker` as partition `key` of the broker at `address`.
    pub fn add_partition(&self, address: &BrokerAddress, key: PartitionKey, broker: Arc<dyn BrokerApi>) {
        self.partitions
            .entry(address.clone())
            .or_default()
            .insert(key, broker);
    }

    pub fn remove_partition(&self, address: &BrokerAddress, key: &PartitionKey) -> bool {
        self.partitions
            .get_mut(address)
            .is_some_and(|mut partitions| partitions.remove(key).is_some())
    }
}

#[async_trait]
impl NamingService for LocalCluster {
    async fn register(&self, name: &str, address: BrokerAddress) -> BrokerResult<()> {
        self.names.insert(name.to_string(), address);
        Ok(())
    }

    async fn resolve(&self, name: &str) -> BrokerResult<Option<BrokerAddress>> {
        Ok(self.names.get(name).map(|entry| entry.value().clone()))
    }

    async fn partition_keys(&self, address: &BrokerAddress) -> BrokerResult<Vec<PartitionKey>> {
        Ok(self
            .partitions
            .get(address)
            .map(|partitions| partitions.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl BrokerConnector for LocalCluster {
    async fn connect(
        &self,
        address: &BrokerAddress,
        partition: &PartitionKey,
    ) -> BrokerResult<Arc<dyn BrokerApi>> {
        self.partitions
            .get(address)
            .and_then(|partitions| partitions.get(partition).cloned())
            .ok_or_else(|| BrokerError::Naming(format!("no partition {partition} hosted at {address}")))
    }
}
