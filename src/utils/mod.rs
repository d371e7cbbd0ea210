//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `partsub` crate.
//!
//! It centralizes the error types shared by the broker and its clients, the
//! logging bootstrap, and the deterministic hashing used for partition routing
//! and queue naming.

pub mod error;
pub mod hashing;
pub mod logging;
