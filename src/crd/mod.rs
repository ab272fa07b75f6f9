//! Custom Resource Definitions for the operator
//!
//! This module contains the CRD types:
//! - BlockStorage: declared backend project, storage classes and QoS policies

pub mod block_storage;

pub use block_storage::*;
