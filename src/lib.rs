//! Relay: multi-channel outbound message relay.
//!
//! Clients submit Mail or Text messages through the managers; a scheduled
//! pipeline dispatches them through prioritized providers, retries failures,
//! and archives old messages.

pub mod cache;
pub mod channels;
pub mod config;
pub mod crypto;
pub mod error;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod relay;
pub mod shutdown;
pub mod store;
