//! Distro Replication
//!
//! AP replication of ephemeral registrations between registry nodes. Every
//! node accepts writes for the keys it is responsible for and publishes the
//! resulting state to every peer asynchronously; peers converge once the
//! pushes land.
//!
//! ## Components
//! - **`types`**: Sync keys, batches and retry tasks.
//! - **`delay`**: The coalescing engine that batches pending syncs per peer.
//! - **`executor`**: Ships due batches using the current store state.
//! - **`failure`**: Splits failed batches into per-key retries.
//! - **`transport`**: The push seam, with the HTTP implementation.
//! - **`service`**: The `DistroProtocol` tying it together with the membership feed.

pub mod delay;
pub mod error;
pub mod executor;
pub mod failure;
pub mod handlers;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod types;
