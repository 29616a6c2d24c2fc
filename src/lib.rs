//! Ephemeral Service Registry Cluster Library
//!
//! This library crate defines the modules that make up a registry node and
//! its client. It serves as the foundation for the binary executable
//! (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip protocol
//!   (SWIM-like) for node discovery and failure detection, and publishes view changes.
//! - **`naming`**: The registry itself. Service and instance types, the responsibility
//!   mapper, the ephemeral store and the session-scoped write path.
//! - **`distro`**: AP replication of the ephemeral store. Coalescing delay engine,
//!   sync executor, retry on failure and ownership handoff on view changes.
//! - **`client`**: The client side. Records every registration and subscription and
//!   replays them until the server converges to the client's intent.
//! - **`config`** / **`server`**: Node flags and the HTTP router.

pub mod client;
pub mod config;
pub mod distro;
pub mod membership;
pub mod naming;
pub mod server;
