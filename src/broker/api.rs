use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::events::QueueStats;
use crate::broker::message::MessageWrapper;
use crate::broker::reference::ReferenceWrapper;
use crate::utils::error::BrokerResult;

/// Snapshot of one broker partition: which subscriber every queue belongs to
/// and the counters collected for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub queues: BTreeMap<String, ReferenceWrapper>,
    pub stats: Vec<QueueStats>,
}

/// What a broker partition exposes to publishers and subscribers.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn subscribe(
        &self,
        reference: ReferenceWrapper,
        message_type_name: &str,
        is_ordered: bool,
    ) -> BrokerResult<()>;

    async fn unsubscribe(&self, reference: &ReferenceWrapper, message_type_name: &str)
    -> BrokerResult<()>;

    async fn publish_message(&self, message: MessageWrapper) -> BrokerResult<()>;

    async fn get_broker_stats(&self) -> BrokerResult<BrokerStats>;
}
