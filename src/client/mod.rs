//! The `client` module is the publisher and subscriber side of the broker.
//!
//! `BrokerClient` routes publishes and subscriptions to the partition owning
//! each message type. `HandlerRegistry` is a ready-made subscriber endpoint
//! dispatching messages to registered handlers, and `StatsAggregator` keeps a
//! rolling history of queue stats across partitions.

pub mod broker_client;
pub mod handlers;
pub mod stats;

pub use broker_client::BrokerClient;
pub use handlers::{HandlerRegistry, SubscriptionOptions, subscribe_handlers};
pub use stats::StatsAggregator;
