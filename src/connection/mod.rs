//! # Connections
//!
//! Client connection bookkeeping and outbound delivery.
//!
//! - **registry**: keyed store of live sockets and their game subscription
//! - **broadcast**: per-recipient fan-out with failure collection and eviction

pub mod broadcast;
pub mod registry;

pub use broadcast::Broadcaster;
pub use registry::{ConnectionId, ConnectionRegistry, ConnectionSink, DeliveryError};
