//! Backend project and credential
//!
//! Both are created on first use and never updated or deleted afterwards.

use crate::auth::AdminKey;
use crate::domain::ports::{
    BackendConnector, CredentialKind, NewCredential, RemoteCredential, RemoteProject,
};
use crate::error::Result;
use tracing::info;

/// Role suffix of the credential the operator signs tokens for
pub const CREDENTIAL_ROLE: &str = "root";

/// Id of the operator's credential in `project`
pub fn credential_id(project: &str) -> String {
    format!("{}:{}", project, CREDENTIAL_ROLE)
}

/// Make sure the backend project exists
pub async fn ensure_project(backend: &dyn BackendConnector, project: &str) -> Result<RemoteProject> {
    if let Some(existing) = backend.get_project(project).await? {
        return Ok(existing);
    }
    info!(project, "creating backend project");
    backend.create_project(project).await
}

/// Make sure the project holds the public half of the admin key
pub async fn ensure_credential(
    backend: &dyn BackendConnector,
    project: &str,
    admin_key: &AdminKey,
) -> Result<RemoteCredential> {
    let id = credential_id(project);
    if let Some(existing) = backend.get_credential(project, &id).await? {
        return Ok(existing);
    }

    info!(project, credential = %id, "uploading admin public key");
    backend
        .create_credential(NewCredential {
            id,
            project_name: project.to_string(),
            kind: CredentialKind::Rs256PublicKey,
            payload: admin_key.public_key_pem().to_string(),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::admin_key::tests::test_key;
    use crate::backend::memory::{BackendCall, BackendOperation, MemoryBackend};
    use crate::error::Error;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_project_created_once() {
        let backend = MemoryBackend::new();
        ensure_project(&backend, "project-a").await.unwrap();
        ensure_project(&backend, "project-a").await.unwrap();

        assert_eq!(
            backend.mutations(),
            vec![BackendCall::CreateProject("project-a".into())]
        );
    }

    #[tokio::test]
    async fn test_lookup_errors_surface_unmodified() {
        let backend = MemoryBackend::new();
        backend.fail_on(BackendOperation::GetProject, "project-a");

        assert_matches!(
            ensure_project(&backend, "project-a").await,
            Err(Error::Backend { operation, .. }) if operation == "GetProject"
        );
        assert!(backend.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_credential_holds_public_key_only() {
        let backend = MemoryBackend::new().with_project("project-a");
        let key = test_key();

        let credential = ensure_credential(&backend, "project-a", &key).await.unwrap();
        assert_eq!(credential.id, "project-a:root");
        assert_eq!(credential.kind, CredentialKind::Rs256PublicKey);
        assert_eq!(credential.payload, key.public_key_pem());
        assert!(!credential.payload.contains("PRIVATE"));

        backend.clear_calls();
        ensure_credential(&backend, "project-a", &key).await.unwrap();
        assert!(backend.mutations().is_empty());
    }
}
