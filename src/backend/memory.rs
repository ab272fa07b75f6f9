//! In-memory backend connector
//!
//! Models the backend control plane in process. Every call is recorded so
//! callers can assert which operations a reconcile pass issued, and failures
//! can be injected per operation and target.

use crate::domain::ports::{
    BackendConnector, BackendInfo, NewCredential, PolicyRequest, PolicyState, RemoteCredential,
    RemotePolicy, RemoteProject,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// Call Log
// =============================================================================

/// Connector operations, used to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    GetProject,
    CreateProject,
    GetCredential,
    CreateCredential,
    ListPolicies,
    CreatePolicy,
    UpdatePolicy,
    DeletePolicy,
}

/// A recorded connector call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    GetProject(String),
    CreateProject(String),
    GetCredential(String),
    CreateCredential(NewCredential),
    ListPolicies,
    CreatePolicy(PolicyRequest),
    UpdatePolicy { id: String, request: PolicyRequest },
    DeletePolicy { id: String, name: String },
    Info,
}

impl BackendCall {
    /// Whether the call changes backend state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            BackendCall::CreateProject(_)
                | BackendCall::CreateCredential(_)
                | BackendCall::CreatePolicy(_)
                | BackendCall::UpdatePolicy { .. }
                | BackendCall::DeletePolicy { .. }
        )
    }
}

// =============================================================================
// Memory Backend
// =============================================================================

#[derive(Debug, Default)]
struct BackendState {
    projects: BTreeMap<String, RemoteProject>,
    /// Credentials by id
    credentials: BTreeMap<String, RemoteCredential>,
    /// Policies by id
    policies: BTreeMap<String, RemotePolicy>,
}

/// In-process backend control plane
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<BackendState>,
    calls: RwLock<Vec<BackendCall>>,
    failures: RwLock<HashSet<(BackendOperation, String)>>,
    next_id: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing policy
    pub fn with_policy(self, policy: RemotePolicy) -> Self {
        self.state.write().policies.insert(policy.id.clone(), policy);
        self
    }

    /// Seed an existing project
    pub fn with_project(self, name: &str) -> Self {
        self.state.write().projects.insert(
            name.to_string(),
            RemoteProject {
                name: name.to_string(),
                description: String::new(),
            },
        );
        self
    }

    /// Make `operation` fail for `target` (project name, credential id or
    /// policy name; empty for list operations)
    pub fn fail_on(&self, operation: BackendOperation, target: &str) {
        self.failures.write().insert((operation, target.to_string()));
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.failures.write().clear();
    }

    /// Recorded calls in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.read().clone()
    }

    /// Recorded calls that changed state
    pub fn mutations(&self) -> Vec<BackendCall> {
        self.calls
            .read()
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.write().clear();
    }

    /// Snapshot of every stored policy
    pub fn policies(&self) -> Vec<RemotePolicy> {
        self.state.read().policies.values().cloned().collect()
    }

    /// Look up a stored credential
    pub fn credential(&self, id: &str) -> Option<RemoteCredential> {
        self.state.read().credentials.get(id).cloned()
    }

    fn record(&self, call: BackendCall) {
        debug!(?call, "memory backend call");
        self.calls.write().push(call);
    }

    fn check(&self, operation: BackendOperation, target: &str) -> Result<()> {
        if self
            .failures
            .read()
            .contains(&(operation, target.to_string()))
        {
            return Err(Error::backend(
                format!("{:?}", operation),
                format!("injected failure for {:?}", target),
            ));
        }
        Ok(())
    }

    fn generate_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:08x}", prefix, n)
    }
}

#[async_trait]
impl BackendConnector for MemoryBackend {
    async fn get_project(&self, name: &str) -> Result<Option<RemoteProject>> {
        self.record(BackendCall::GetProject(name.to_string()));
        self.check(BackendOperation::GetProject, name)?;
        Ok(self.state.read().projects.get(name).cloned())
    }

    async fn create_project(&self, name: &str) -> Result<RemoteProject> {
        self.record(BackendCall::CreateProject(name.to_string()));
        self.check(BackendOperation::CreateProject, name)?;

        let mut state = self.state.write();
        if state.projects.contains_key(name) {
            return Err(Error::backend(
                "CreateProject",
                format!("project {:?} already exists", name),
            ));
        }
        let project = RemoteProject {
            name: name.to_string(),
            description: String::new(),
        };
        state.projects.insert(name.to_string(), project.clone());
        Ok(project)
    }

    async fn get_credential(&self, project: &str, id: &str) -> Result<Option<RemoteCredential>> {
        self.record(BackendCall::GetCredential(id.to_string()));
        self.check(BackendOperation::GetCredential, id)?;
        Ok(self
            .state
            .read()
            .credentials
            .get(id)
            .filter(|c| c.project_name == project)
            .cloned())
    }

    async fn create_credential(&self, request: NewCredential) -> Result<RemoteCredential> {
        self.record(BackendCall::CreateCredential(request.clone()));
        self.check(BackendOperation::CreateCredential, &request.id)?;

        let mut state = self.state.write();
        if !state.projects.contains_key(&request.project_name) {
            return Err(Error::backend(
                "CreateCredential",
                format!("project {:?} does not exist", request.project_name),
            ));
        }
        if state.credentials.contains_key(&request.id) {
            return Err(Error::backend(
                "CreateCredential",
                format!("credential {:?} already exists", request.id),
            ));
        }
        let credential = RemoteCredential {
            id: request.id,
            project_name: request.project_name,
            kind: request.kind,
            payload: request.payload,
        };
        state
            .credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(credential)
    }

    async fn list_policies(&self) -> Result<Vec<RemotePolicy>> {
        self.record(BackendCall::ListPolicies);
        self.check(BackendOperation::ListPolicies, "")?;
        Ok(self.policies())
    }

    async fn create_policy(&self, request: &PolicyRequest) -> Result<RemotePolicy> {
        self.record(BackendCall::CreatePolicy(request.clone()));
        self.check(BackendOperation::CreatePolicy, &request.name)?;

        let mut state = self.state.write();
        if state.policies.values().any(|p| p.name == request.name) {
            return Err(Error::backend(
                "CreatePolicy",
                format!("policy {:?} already exists", request.name),
            ));
        }
        let policy = RemotePolicy {
            id: self.generate_id("policy"),
            name: request.name.clone(),
            description: request.description.clone(),
            visibility: request.visibility.clone(),
            limit: Some(request.limit),
            state: PolicyState::Active,
        };
        state.policies.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    async fn update_policy(&self, id: &str, request: &PolicyRequest) -> Result<()> {
        self.record(BackendCall::UpdatePolicy {
            id: id.to_string(),
            request: request.clone(),
        });
        self.check(BackendOperation::UpdatePolicy, &request.name)?;

        let mut state = self.state.write();
        let policy = state.policies.get_mut(id).ok_or_else(|| {
            Error::backend("UpdatePolicy", format!("policy {:?} does not exist", id))
        })?;
        policy.description = request.description.clone();
        policy.visibility = request.visibility.clone();
        policy.limit = Some(request.limit);
        Ok(())
    }

    async fn delete_policy(&self, id: &str, name: &str) -> Result<()> {
        self.record(BackendCall::DeletePolicy {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.check(BackendOperation::DeletePolicy, name)?;

        match self.state.write().policies.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::backend(
                "DeletePolicy",
                format!("policy {:?} does not exist", id),
            )),
        }
    }

    async fn info(&self) -> Result<BackendInfo> {
        self.record(BackendCall::Info);
        Ok(BackendInfo {
            api_version: "v2".to_string(),
            api_endpoints: vec!["127.0.0.1:443".to_string()],
        })
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CredentialKind, PolicyVisibility};
    use crate::domain::qos::{QoSLimit, ReadWrite};
    use assert_matches::assert_matches;

    fn request(name: &str) -> PolicyRequest {
        PolicyRequest {
            name: name.into(),
            description: "test".into(),
            visibility: PolicyVisibility::Global,
            limit: QoSLimit::Bandwidth(ReadWrite::new(1, 1)),
        }
    }

    #[tokio::test]
    async fn test_project_lifecycle() {
        let backend = MemoryBackend::new();
        assert!(backend.get_project("p").await.unwrap().is_none());

        backend.create_project("p").await.unwrap();
        assert!(backend.get_project("p").await.unwrap().is_some());
        assert!(backend.create_project("p").await.is_err());

        assert_eq!(backend.mutations(), vec![BackendCall::CreateProject("p".into())]);
    }

    #[tokio::test]
    async fn test_credential_requires_project() {
        let backend = MemoryBackend::new();
        let request = NewCredential {
            id: "p:root".into(),
            project_name: "p".into(),
            kind: CredentialKind::Rs256PublicKey,
            payload: "pem".into(),
        };
        assert!(backend.create_credential(request.clone()).await.is_err());

        backend.create_project("p").await.unwrap();
        backend.create_credential(request).await.unwrap();
        assert!(backend.get_credential("p", "p:root").await.unwrap().is_some());
        assert!(backend.get_credential("q", "p:root").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_policy_crud_and_injection() {
        let backend = MemoryBackend::new();
        let created = backend.create_policy(&request("a")).await.unwrap();
        assert!(backend.create_policy(&request("a")).await.is_err());

        let mut changed = request("a");
        changed.limit = QoSLimit::IopsPerGb(ReadWrite::new(5, 5));
        backend.update_policy(&created.id, &changed).await.unwrap();
        assert_eq!(backend.policies()[0].limit, Some(changed.limit));

        backend.fail_on(BackendOperation::DeletePolicy, "a");
        assert_matches!(
            backend.delete_policy(&created.id, "a").await,
            Err(Error::Backend { .. })
        );
        backend.clear_failures();
        backend.delete_policy(&created.id, "a").await.unwrap();
        assert!(backend.policies().is_empty());
    }
}
