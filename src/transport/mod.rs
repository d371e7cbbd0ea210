//! The `transport` module defines the contracts between the broker and the
//! runtime hosting it.
//!
//! The broker never talks to the network directly. It resolves subscriber
//! endpoints through an `EndpointResolver`, discovers broker partitions through
//! a `NamingService`, and reaches a partition through a `BrokerConnector`.
//! `local` provides in-process implementations of all three.

pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerApi;
use crate::broker::message::MessageWrapper;
use crate::broker::reference::SubscriberRef;
use crate::utils::error::{BrokerResult, DeliveryError};

pub use local::{LocalCluster, LocalEndpoints};

/// Key of one partition of a partitioned service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PartitionKey {
    Singleton,
    Int64(i64),
    Named(String),
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Singleton => write!(f, "singleton"),
            PartitionKey::Int64(key) => write!(f, "{key}"),
            PartitionKey::Named(name) => write!(f, "{name}"),
        }
    }
}

/// Address a broker service is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerAddress(String);

impl BrokerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contract every subscriber endpoint exposes to the broker.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn receive_message(&self, message: MessageWrapper) -> Result<(), DeliveryError>;
}

/// Resolves a subscriber reference to a live endpoint.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, target: &SubscriberRef) -> Result<Arc<dyn Subscriber>, DeliveryError>;
}

/// Directory of named broker addresses and their partitions.
#[async_trait]
pub trait NamingService: Send + Sync {
    async fn register(&self, name: &str, address: BrokerAddress) -> BrokerResult<()>;

    /// `None` when nothing is registered under `name`.
    async fn resolve(&self, name: &str) -> BrokerResult<Option<BrokerAddress>>;

    async fn partition_keys(&self, address: &BrokerAddress) -> BrokerResult<Vec<PartitionKey>>;
}

/// Opens a handle to one partition of a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        address: &BrokerAddress,
        partition: &PartitionKey,
    ) -> BrokerResult<Arc<dyn BrokerApi>>;
}
