//! Backend connector adapters
//!
//! Implementations of [`BackendConnector`](crate::domain::BackendConnector):
//!
//! - [`rest`]: the backend's JSON management API over HTTPS
//! - [`memory`]: an in-process model used by tests and dry runs

pub mod memory;
pub mod rest;

pub use memory::{BackendCall, BackendOperation, MemoryBackend};
pub use rest::{RestConfig, RestConnector};
