//! Naming Client
//!
//! Client side of the registry. Whatever the caller registers or subscribes
//! to is remembered in the redo registry and re-applied until the server
//! state matches, across failed calls, lost sessions and reconnects.
//!
//! ## Components
//! - **`redo`**: Redo entries and their derived `RedoType`.
//! - **`scheduler`**: The periodic redo sweep.
//! - **`connection`**: Session, heartbeats and reconnects.
//! - **`rpc`**: The `NamingRpc` seam and its HTTP implementation.
//! - **`proxy`**: The `NamingClient` facade.

pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod redo;
pub mod rpc;
pub mod scheduler;
