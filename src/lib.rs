//! # PartSub
//!
//! `partsub` is a partitioned publish/subscribe broker. Each broker partition
//! owns the message types that hash onto it, keeps one durable queue per
//! (subscriber, message type) pair and drains those queues to subscriber
//! endpoints from a background delivery loop.
//!
//! ## Core Modules
//!
//! - `broker`: the engine itself: subscriptions, fan-out, the delivery loop,
//!   broker events and the service locator.
//! - `client`: publishing, handler registration and stats polling.
//! - `config`: layered settings (defaults, config files, environment).
//! - `persistence`: transactional key/value and queue storage backed by sled,
//!   plus the timeout retry helper.
//! - `transport`: the seams to the hosting runtime (naming, endpoint
//!   resolution, broker connections) and an in-process implementation.
//! - `utils`: errors, logging and stable hashing.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
