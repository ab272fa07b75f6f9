//! Domain Ports - Core trait definitions for the operator
//!
//! These traits define the boundaries between the reconciliation core and the
//! systems it drives: the backend control plane, the declared-state store and
//! the platform object API. Adapters implement these traits to provide
//! concrete functionality.

use crate::crd::{BlockStorage, BlockStorageStatus};
use crate::domain::qos::QoSLimit;
use crate::error::Result;
use async_trait::async_trait;
use kube::core::ApiResource;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Backend Resources
// =============================================================================

/// A backend project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Type of a backend credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKind {
    /// PEM encoded RSA public key validating RS256 signed tokens
    #[serde(rename = "RS256PubKey")]
    Rs256PublicKey,
}

/// A backend credential. Holds only the public half of a key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCredential {
    /// Credential id, `<project>:<role>`
    pub id: String,
    pub project_name: String,
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    /// PEM encoded public key
    pub payload: String,
}

/// Request to create a credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCredential {
    pub id: String,
    pub project_name: String,
    #[serde(rename = "type")]
    pub kind: CredentialKind,
    pub payload: String,
}

/// Who a QoS policy applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PolicyVisibility {
    /// Applies tenant wide; owned by this operator
    Global,
    /// Applies to the listed projects only; owned by someone else
    Scoped { projects: Vec<String> },
}

impl PolicyVisibility {
    pub fn is_global(&self) -> bool {
        matches!(self, PolicyVisibility::Global)
    }
}

/// Backend lifecycle state of a policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyState {
    Creating,
    Active,
    Updating,
    Deleting,
    Failed,
    #[default]
    Unknown,
}

/// A QoS policy as stored on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub visibility: PolicyVisibility,
    /// `None` for policies that are not rate limits
    #[serde(default)]
    pub limit: Option<QoSLimit>,
    #[serde(default)]
    pub state: PolicyState,
}

impl RemotePolicy {
    /// Only global rate-limit policies are owned by this operator
    pub fn is_owned(&self) -> bool {
        self.visibility.is_global() && self.limit.is_some()
    }
}

/// Payload for policy creation and update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    pub name: String,
    pub description: String,
    pub visibility: PolicyVisibility,
    pub limit: QoSLimit,
}

/// Version and topology reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub api_version: String,
    #[serde(default)]
    pub api_endpoints: Vec<String>,
}

// =============================================================================
// Backend Connector Port
// =============================================================================

/// Port for the remote storage control plane.
///
/// Lookups return `Ok(None)` when the backend reports the object as missing.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Get a project by name
    async fn get_project(&self, name: &str) -> Result<Option<RemoteProject>>;

    /// Create a project
    async fn create_project(&self, name: &str) -> Result<RemoteProject>;

    /// Get a credential of a project
    async fn get_credential(&self, project: &str, id: &str) -> Result<Option<RemoteCredential>>;

    /// Upload a credential
    async fn create_credential(&self, request: NewCredential) -> Result<RemoteCredential>;

    /// List every QoS policy visible to the admin
    async fn list_policies(&self) -> Result<Vec<RemotePolicy>>;

    /// Create a QoS policy
    async fn create_policy(&self, request: &PolicyRequest) -> Result<RemotePolicy>;

    /// Update description and limit of an existing policy
    async fn update_policy(&self, id: &str, request: &PolicyRequest) -> Result<()>;

    /// Delete a policy
    async fn delete_policy(&self, id: &str, name: &str) -> Result<()>;

    /// Backend version and cluster endpoints
    async fn info(&self) -> Result<BackendInfo>;

    /// Get connector name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Declared State Store Port
// =============================================================================

/// Key of one declared state object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub namespace: String,
    pub name: String,
}

impl StateKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Port for reading declared state and writing its status
#[async_trait]
pub trait DeclaredStateStore: Send + Sync {
    /// Get the declared state, `None` if it does not exist
    async fn get(&self, key: &StateKey) -> Result<Option<BlockStorage>>;

    /// Replace the status of `current`. Fails with a conflict error when
    /// `current` is no longer the latest revision.
    async fn update_status(&self, current: &BlockStorage, status: BlockStorageStatus)
        -> Result<()>;

    /// Add or remove a finalizer on the object
    async fn set_finalizer(&self, current: &BlockStorage, finalizer: &str, present: bool)
        -> Result<()>;
}

// =============================================================================
// Platform Object Port
// =============================================================================

/// Location of a platform object
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    /// Reference an object of a statically typed kind
    pub fn of<K>(namespace: Option<&str>, name: &str) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            resource: ApiResource::erase::<K>(&()),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Stable identity used by in-memory stores
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.resource.api_version,
            self.resource.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.resource.kind, self.name),
        }
    }
}

/// Outcome of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Deletion was accepted; the object may still be visible for a while
    Requested,
    /// The object did not exist
    AlreadyGone,
}

/// Port for platform objects, addressed untyped as JSON documents
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Get an object, `None` if it does not exist
    async fn get(&self, target: &ObjectRef) -> Result<Option<serde_json::Value>>;

    /// Server-side apply of the owned fields in `object`, creating the
    /// object when it does not exist
    async fn apply(&self, target: &ObjectRef, object: serde_json::Value) -> Result<()>;

    /// Request deletion of an object
    async fn delete(&self, target: &ObjectRef) -> Result<DeleteOutcome>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BackendConnectorRef = Arc<dyn BackendConnector>;
pub type DeclaredStateStoreRef = Arc<dyn DeclaredStateStore>;
pub type ResourceClientRef = Arc<dyn ResourceClient>;
