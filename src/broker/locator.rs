//! Finds the broker and the partition owning a message type.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::transport::{BrokerAddress, NamingService, PartitionKey};
use crate::utils::error::{BrokerError, BrokerResult};
use crate::utils::hashing::partition_index;

/// Resolves the broker address by name and maps message types onto its
/// partitions. Both lookups are cached until `invalidate` is called.
pub struct BrokerServiceLocator {
    naming: Arc<dyn NamingService>,
    broker_name: String,
    address: RwLock<Option<BrokerAddress>>,
    partitions: RwLock<Option<Arc<Vec<PartitionKey>>>>,
}

impl BrokerServiceLocator {
    pub fn new(naming: Arc<dyn NamingService>, broker_name: impl Into<String>) -> Self {
        Self {
            naming,
            broker_name: broker_name.into(),
            address: RwLock::new(None),
            partitions: RwLock::new(None),
        }
    }

    pub fn broker_name(&self) -> &str {
        &self.broker_name
    }

    /// Publish `address` as the broker's address.
    pub async fn register(&self, address: BrokerAddress) -> BrokerResult<()> {
        self.naming
            .register(&self.broker_name, address.clone())
            .await?;
        info!(broker = %self.broker_name, %address, "broker registered");
        *self.address.write().await = Some(address);
        Ok(())
    }

    pub async fn locate(&self) -> BrokerResult<BrokerAddress> {
        if let Some(address) = self.address.read().await.as_ref() {
            return Ok(address.clone());
        }

        let mut cached = self.address.write().await;
        if let Some(address) = cached.as_ref() {
            return Ok(address.clone());
        }
        let address = self
            .naming
            .resolve(&self.broker_name)
            .await?
            .ok_or_else(|| BrokerError::BrokerNotFound {
                name: self.broker_name.clone(),
            })?;
        debug!(broker = %self.broker_name, %address, "broker located");
        *cached = Some(address.clone());
        Ok(address)
    }

    /// Partition keys of the located broker, in the order the naming service
    /// lists them.
    pub async fn partition_keys(&self) -> BrokerResult<Arc<Vec<PartitionKey>>> {
        if let Some(keys) = self.partitions.read().await.as_ref() {
            return Ok(Arc::clone(keys));
        }

        let address = self.locate().await?;
        let mut cached = self.partitions.write().await;
        if let Some(keys) = cached.as_ref() {
            return Ok(Arc::clone(keys));
        }
        let keys = self.naming.partition_keys(&address).await?;
        if keys.is_empty() {
            return Err(BrokerError::NoPartitions {
                address: address.to_string(),
            });
        }
        let keys = Arc::new(keys);
        *cached = Some(Arc::clone(&keys));
        Ok(keys)
    }

    /// `hash(message_type_name) mod partition_count`, as a partition key.
    pub async fn get_partition_for_message(&self, message_type_name: &str) -> BrokerResult<PartitionKey> {
        let keys = self.partition_keys().await?;
        let index = partition_index(message_type_name, keys.len());
        keys.get(index)
            .cloned()
            .ok_or_else(|| BrokerError::NoPartitions {
                address: self.broker_name.clone(),
            })
    }

    /// Forget the cached address and partitions.
    pub async fn invalidate(&self) {
        *self.address.write().await = None;
        *self.partitions.write().await = None;
    }
}

impl std::fmt::Debug for BrokerServiceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerServiceLocator")
            .field("broker_name", &self.broker_name)
            .finish()
    }
}
