//! The `broker` module is the engine of the system.
//!
//! A `BrokerService` owns one partition: the subscriber directories of the
//! message types hashed to it, one durable queue per subscription, and the
//! delivery loop draining those queues. `BrokerServiceLocator` finds the
//! partition owning a message type.

pub mod api;
pub mod delivery;
pub mod engine;
pub mod events;
pub mod locator;
pub mod message;
pub mod reference;
pub mod state;
pub mod subscription;

pub use api::{BrokerApi, BrokerStats};
pub use delivery::DeliveryLoop;
pub use engine::{BROKER_STATE_DICTIONARY, BrokerService, DeliveryPass, EngineState};
pub use events::{BrokerEvent, BrokerEventsManager, DefaultBrokerEventsManager, QueueStats};
pub use locator::BrokerServiceLocator;
pub use message::MessageWrapper;
pub use reference::{ActorId, ReferenceWrapper, RoutingKey, SubscriberRef};
pub use state::BrokerServiceState;
pub use subscription::{Subscription, SubscriptionDetails, SubscriptionFactory};

#[cfg(test)]
mod tests;
