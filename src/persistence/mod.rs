//! The `persistence` module provides the transactional storage the broker
//! keeps its subscription directory and subscriber queues in.
//!
//! `StateManager` exposes named dictionaries and two queue flavours (strict
//! FIFO and concurrent), every operation scoped to a `Transaction` that either
//! commits atomically or rolls back. Exclusive locks are bounded by a timeout;
//! an expired wait surfaces as `StoreError::Timeout`, the only failure the
//! `TimeoutRetryHelper` retries.
//!
//! State is held in memory and, when opened on a path, every commit is also
//! written atomically to an embedded `sled` database so a restarted broker
//! sees the same subscriptions and queued messages.

pub mod retry;
pub mod sled_store;
pub mod state;

pub use retry::{TimeoutRetryHelper, TransientError};
pub use sled_store::SledStore;
pub use state::{QueueKind, ReliableConcurrentQueue, ReliableQueue, StateManager, Transaction};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out waiting for lock on {resource}")]
    Timeout { resource: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("queue not found: {name}")]
    QueueNotFound { name: String },

    #[error("queue {name} already exists as {existing:?}")]
    QueueKindMismatch { name: String, existing: QueueKind },

    #[error("transaction {id} is already completed")]
    TransactionClosed { id: u64 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sled failure: {0}")]
    Sled(#[from] sled::Error),

    #[error("corrupt record under key {key}")]
    Corrupt { key: String },
}

impl TransientError for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;
