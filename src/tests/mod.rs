//! Scenarios spanning the broker, its storage and the client side.

pub(crate) mod support;
