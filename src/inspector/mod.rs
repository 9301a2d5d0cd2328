//! Inspector protocol bridge
//!
//! Client side of the runtime's remote debugging protocol: JSON requests
//! and events over a WebSocket opened on the runtime's debug port.

pub mod client;
pub mod types;

pub use client::{connect_with_retry, discover, InspectorClient, RetryPolicy};
pub use types::*;
