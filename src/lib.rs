//! Block Storage Operator
//!
//! A Kubernetes operator that exposes a remote NVMe/TCP block-storage backend
//! to a cluster. For every `BlockStorage` object it keeps a backend project,
//! an uploaded public-key credential, a signed access token, the global QoS
//! policies and the CSI storage classes in sync.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Reconcile Control Loop                      │
//! │  Validate → Project → Credential → Token → Policies → Sync → Status │
//! ├──────────────────────┬───────────────────────┬───────────────────┤
//! │  Backend Connector   │  Declared-State Store │  Resource Client  │
//! │  (REST / memory)     │  (BlockStorage CRD)   │  (kube / memory)  │
//! └──────────────────────┴───────────────────────┴───────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconciler`]: control loop and its steps
//! - [`backend`]: backend connector adapters
//! - [`cluster`]: Kubernetes and in-memory cluster adapters
//! - [`manifests`]: static CSI driver objects
//! - [`auth`]: admin key and access tokens
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: QoS types and ports
//! - [`config`]: operator configuration
//! - [`metrics`]: Prometheus collectors
//! - [`error`]: Error types and handling

pub mod auth;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod manifests;
pub mod metrics;
pub mod reconciler;

// Re-export commonly used types
pub use auth::{AccessToken, AdminKey, TokenClaims};

pub use backend::{MemoryBackend, RestConfig, RestConnector};

pub use cluster::{KubeResourceClient, KubeStateStore, MemoryResourceClient, MemoryStateStore};

pub use config::{Endpoint, Endpoints, OperatorConfig, TokenPolicy};

pub use crd::{
    BlockStorage, BlockStorageSpec, BlockStorageStatus, HealthState, ManagedResourceStatus,
    QoSPolicyLimitSpec, QoSPolicySpec, StorageClassSpec,
};

pub use domain::ports::{
    BackendConnector, BackendConnectorRef, DeclaredStateStore, DeclaredStateStoreRef,
    ResourceClient, ResourceClientRef, StateKey,
};
pub use domain::qos::{QoSLimit, QoSPolicyDef, ReadWrite};

pub use error::{Error, ErrorAction, Result};

pub use manifests::ManagedManifests;

pub use metrics::ReconcileMetrics;

pub use reconciler::{PolicyEnsurer, ReconcileOutcome, Reconciler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
