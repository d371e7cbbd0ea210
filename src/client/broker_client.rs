use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::broker::api::{BrokerApi, BrokerStats};
use crate::broker::locator::BrokerServiceLocator;
use crate::broker::message::MessageWrapper;
use crate::broker::reference::ReferenceWrapper;
use crate::transport::{BrokerConnector, PartitionKey};
use crate::utils::error::BrokerResult;

/// Publisher and subscriber side of the broker. Every call is routed to the
/// partition owning the message type involved.
pub struct BrokerClient {
    locator: Arc<BrokerServiceLocator>,
    connector: Arc<dyn BrokerConnector>,
}

impl BrokerClient {
    pub fn new(locator: Arc<BrokerServiceLocator>, connector: Arc<dyn BrokerConnector>) -> Self {
        Self { locator, connector }
    }

    pub fn locator(&self) -> &BrokerServiceLocator {
        &self.locator
    }

    /// Handle to the partition owning `message_type_name`.
    pub async fn partition_for(&self, message_type_name: &str) -> BrokerResult<Arc<dyn BrokerApi>> {
        let address = self.locator.locate().await?;
        let partition = self.locator.get_partition_for_message(message_type_name).await?;
        debug!(message_type = message_type_name, %partition, "routing to partition");
        self.connector.connect(&address, &partition).await
    }

    pub async fn publish_message(&self, message: MessageWrapper) -> BrokerResult<()> {
        let broker = self.partition_for(message.message_type()).await?;
        broker.publish_message(message).await
    }

    /// Serialize `payload` as JSON and publish it as `message_type_name`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        message_type_name: &str,
        payload: &T,
    ) -> BrokerResult<()> {
        let message = MessageWrapper::new(message_type_name, serde_json::to_string(payload)?);
        self.publish_message(message).await
    }

    pub async fn subscribe(
        &self,
        reference: ReferenceWrapper,
        message_type_name: &str,
        is_ordered: bool,
    ) -> BrokerResult<()> {
        let broker = self.partition_for(message_type_name).await?;
        broker
            .subscribe(reference, message_type_name, is_ordered)
            .await
    }

    pub async fn unsubscribe(
        &self,
        reference: &ReferenceWrapper,
        message_type_name: &str,
    ) -> BrokerResult<()> {
        let broker = self.partition_for(message_type_name).await?;
        broker.unsubscribe(reference, message_type_name).await
    }

    /// Stats of every partition of the broker.
    pub async fn get_broker_stats(&self) -> BrokerResult<Vec<(PartitionKey, BrokerStats)>> {
        let address = self.locator.locate().await?;
        let keys = self.locator.partition_keys().await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys.iter() {
            let broker = self.connector.connect(&address, key).await?;
            out.push((key.clone(), broker.get_broker_stats().await?));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("broker", &self.locator.broker_name())
            .finish()
    }
}
