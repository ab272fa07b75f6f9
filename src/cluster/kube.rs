//! Kubernetes-backed adapters
//!
//! [`KubeStateStore`] reads `BlockStorage` objects and writes their status
//! subresource. [`KubeResourceClient`] manages the platform objects the
//! reconciler owns through the dynamic API.

use crate::config::FIELD_MANAGER;
use crate::crd::{BlockStorage, BlockStorageStatus};
use crate::domain::ports::{
    DeclaredStateStore, DeleteOutcome, ObjectRef, ResourceClient, StateKey,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

/// Map an API 409 to [`Error::Conflict`], pass everything else through
fn conflict_or(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        other => Error::Kube(other),
    }
}

// =============================================================================
// Declared State Store
// =============================================================================

/// `BlockStorage` objects in the cluster
#[derive(Clone)]
pub struct KubeStateStore {
    client: Client,
}

impl KubeStateStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, object: &BlockStorage) -> Result<Api<BlockStorage>> {
        let namespace = object.namespace().ok_or_else(|| {
            Error::Internal(format!("BlockStorage {} has no namespace", object.name()))
        })?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl DeclaredStateStore for KubeStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<BlockStorage>> {
        let api: Api<BlockStorage> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn update_status(
        &self,
        current: &BlockStorage,
        status: BlockStorageStatus,
    ) -> Result<()> {
        let api = self.api_for(current)?;
        let name = current.name_any();

        // The object keeps the resourceVersion it was read at, so the API
        // server rejects the write if someone else got there first.
        let mut object = current.clone();
        object.status = Some(status);
        let data = serde_json::to_vec(&object)?;

        api.replace_status(&name, &post_params(), data)
            .await
            .map_err(|e| conflict_or(e, "BlockStorage", &name))?;
        debug!(name = %name, "status written");
        Ok(())
    }

    async fn set_finalizer(
        &self,
        current: &BlockStorage,
        finalizer: &str,
        present: bool,
    ) -> Result<()> {
        let api = self.api_for(current)?;
        let name = current.name_any();

        let mut finalizers: Vec<String> = current
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        if present {
            finalizers.push(finalizer.to_string());
        }

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": current.resource_version(),
            }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| conflict_or(e, "BlockStorage", &name))?;
        Ok(())
    }
}

// =============================================================================
// Resource Client
// =============================================================================

/// Platform objects through the dynamic API
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, target: &ObjectRef) -> Api<DynamicObject> {
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.resource),
            None => Api::all_with(self.client.clone(), &target.resource),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, target: &ObjectRef) -> Result<Option<serde_json::Value>> {
        match self.api(target).get_opt(&target.name).await? {
            Some(object) => Ok(Some(serde_json::to_value(object)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, target: &ObjectRef, object: serde_json::Value) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(target)
            .patch(&target.name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| conflict_or(e, &target.resource.kind, &target.name))?;
        debug!(object = %target, "applied");
        Ok(())
    }

    async fn delete(&self, target: &ObjectRef) -> Result<DeleteOutcome> {
        match self
            .api(target)
            .delete(&target.name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Requested),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Ok(DeleteOutcome::AlreadyGone)
            }
            // Someone else is deleting it as well
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Ok(DeleteOutcome::Requested)
            }
            Err(e) => Err(e.into()),
        }
    }
}
