//! Naming
//!
//! The service-discovery data plane of a registry node: service keys and
//! instance records, ownership of keys, the ephemeral store and the
//! client-facing API with its sessions.
//!
//! ## Components
//! - **`types`**: `ServiceKey` and `Instance`.
//! - **`mapper`**: Which node owns which key.
//! - **`store`**: The local ephemeral store and its sync snapshots.
//! - **`sessions`**: Client sessions, heartbeats and expiry.
//! - **`service`**: Write routing (apply on the owner, forward otherwise) and reads.
//! - **`handlers`** / **`protocol`**: The HTTP surface.

pub mod error;
pub mod handlers;
pub mod mapper;
pub mod protocol;
pub mod service;
pub mod sessions;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;
