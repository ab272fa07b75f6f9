//! Cluster adapters
//!
//! Implementations of the declared-state store and the platform object
//! client: one pair backed by the Kubernetes API, one held in memory.

pub mod kube;
pub mod memory;

pub use self::kube::{KubeResourceClient, KubeStateStore};
pub use self::memory::{MemoryResourceClient, MemoryStateStore, ResourceOp};
