//! The `error` module defines the error types used across the broker.
//!
//! `BrokerError` is what broker and client operations return. Storage failures
//! are wrapped from `StoreError`; only storage timeouts are considered transient
//! by the retry helper.

use crate::persistence::{StoreError, TransientError};

/// Failure reported by (or while reaching) a subscriber endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("no endpoint registered for {target}")]
    EndpointNotFound { target: String },

    #[error("subscriber rejected message: {reason}")]
    Rejected { reason: String },

    #[error("no handler registered for message type {message_type}")]
    NoHandler { message_type: String },

    #[error("payload of {message_type} could not be decoded: {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },
}

impl DeliveryError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("broker '{name}' could not be located")]
    BrokerNotFound { name: String },

    #[error("broker at {address} exposes no partitions")]
    NoPartitions { address: String },

    #[error("delivery to {subscriber} failed: {source}")]
    Delivery {
        subscriber: String,
        #[source]
        source: DeliveryError,
    },

    #[error("naming service failure: {0}")]
    Naming(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn is_broker_not_found(&self) -> bool {
        matches!(self, Self::BrokerNotFound { .. })
    }
}

impl TransientError for BrokerError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Store(inner) if inner.is_transient())
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
