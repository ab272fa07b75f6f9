//! In-memory cluster adapters
//!
//! Mimic the parts of the API server the reconciler relies on: resource
//! versions with optimistic concurrency, finalizers that hold back deletion,
//! and deletions that take a while to become visible.

use crate::crd::{BlockStorage, BlockStorageStatus};
use crate::domain::ports::{
    DeclaredStateStore, DeleteOutcome, ObjectRef, ResourceClient, StateKey,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// =============================================================================
// Memory State Store
// =============================================================================

/// Declared state held in memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    objects: RwLock<BTreeMap<StateKey, BlockStorage>>,
    revision: AtomicU64,
    /// Status writes that will fail with a conflict before one succeeds
    pending_conflicts: AtomicU32,
    status_writes: AtomicU32,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Store an object, assigning a fresh resource version
    pub fn insert(&self, mut object: BlockStorage) -> StateKey {
        let key = StateKey::new(
            object.namespace().unwrap_or_default(),
            object.name_any(),
        );
        object.metadata.resource_version = Some(self.next_revision());
        self.objects.write().insert(key.clone(), object);
        key
    }

    /// Current stored object
    pub fn snapshot(&self, key: &StateKey) -> Option<BlockStorage> {
        self.objects.read().get(key).cloned()
    }

    /// Request deletion; held back while finalizers remain
    pub fn delete(&self, key: &StateKey) {
        let mut objects = self.objects.write();
        let Some(object) = objects.get_mut(key) else {
            return;
        };
        if object.finalizers().is_empty() {
            objects.remove(key);
        } else {
            object.metadata.deletion_timestamp = Some(Time(Utc::now()));
            object.metadata.resource_version = Some(self.next_revision());
        }
    }

    /// Bump the revision of a stored object as if another writer touched it
    pub fn touch(&self, key: &StateKey) {
        if let Some(object) = self.objects.write().get_mut(key) {
            object.metadata.resource_version = Some(self.next_revision());
        }
    }

    /// Make the next `count` status writes fail with a conflict
    pub fn inject_status_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful status writes
    pub fn status_writes(&self) -> u32 {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn conflict(key: &StateKey) -> Error {
        Error::Conflict {
            kind: "BlockStorage".to_string(),
            name: key.to_string(),
        }
    }

    fn key_of(object: &BlockStorage) -> StateKey {
        StateKey::new(object.namespace().unwrap_or_default(), object.name_any())
    }
}

#[async_trait]
impl DeclaredStateStore for MemoryStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<BlockStorage>> {
        Ok(self.snapshot(key))
    }

    async fn update_status(
        &self,
        current: &BlockStorage,
        status: BlockStorageStatus,
    ) -> Result<()> {
        let key = Self::key_of(current);
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.touch(&key);
            return Err(Self::conflict(&key));
        }

        let mut objects = self.objects.write();
        let stored = objects.get_mut(&key).ok_or_else(|| Error::ResourceNotFound {
            kind: "BlockStorage".to_string(),
            name: key.to_string(),
        })?;
        if stored.metadata.resource_version != current.metadata.resource_version {
            return Err(Self::conflict(&key));
        }
        stored.status = Some(status);
        stored.metadata.resource_version = Some(self.next_revision());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_finalizer(
        &self,
        current: &BlockStorage,
        finalizer: &str,
        present: bool,
    ) -> Result<()> {
        let key = Self::key_of(current);
        let mut objects = self.objects.write();
        let stored = objects.get_mut(&key).ok_or_else(|| Error::ResourceNotFound {
            kind: "BlockStorage".to_string(),
            name: key.to_string(),
        })?;
        if stored.metadata.resource_version != current.metadata.resource_version {
            return Err(Self::conflict(&key));
        }

        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        finalizers.retain(|f| f != finalizer);
        if present {
            finalizers.push(finalizer.to_string());
        }
        stored.metadata.resource_version = Some(self.next_revision());

        // The last finalizer gone on a deleted object releases it
        let released =
            stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty();
        if released {
            objects.remove(&key);
        }
        Ok(())
    }
}

// =============================================================================
// Memory Resource Client
// =============================================================================

/// A write issued against the memory resource client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOp {
    Apply(String),
    Delete(String),
}

/// Platform objects held in memory as JSON documents
#[derive(Debug, Default)]
pub struct MemoryResourceClient {
    objects: DashMap<String, serde_json::Value>,
    /// Deleted objects that stay visible for this many more reads
    terminating: DashMap<String, u32>,
    delete_lag: AtomicU32,
    failing_reads: RwLock<HashSet<String>>,
    ops: RwLock<Vec<ResourceOp>>,
    revision: AtomicU64,
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep deleted objects visible for `reads` further reads
    pub fn with_delete_lag(self, reads: u32) -> Self {
        self.delete_lag.store(reads, Ordering::SeqCst);
        self
    }

    /// Store an object directly, bypassing the op log
    pub fn seed(&self, target: &ObjectRef, mut object: serde_json::Value) {
        self.stamp(&mut object);
        self.objects.insert(target.key(), object);
    }

    /// Current stored object, ignoring delete lag
    pub fn snapshot(&self, target: &ObjectRef) -> Option<serde_json::Value> {
        self.objects.get(&target.key()).map(|v| v.value().clone())
    }

    /// Overwrite the `status` of a stored object
    pub fn set_status(&self, target: &ObjectRef, status: serde_json::Value) {
        if let Some(mut object) = self.objects.get_mut(&target.key()) {
            object["status"] = status;
        }
    }

    /// Make reads of `target` fail
    pub fn fail_reads(&self, target: &ObjectRef) {
        self.failing_reads.write().insert(target.key());
    }

    /// Recorded writes in order
    pub fn ops(&self) -> Vec<ResourceOp> {
        self.ops.read().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.write().clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn stamp(&self, object: &mut serde_json::Value) {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        object["metadata"]["resourceVersion"] = serde_json::Value::String(revision.to_string());
    }

    fn record(&self, op: ResourceOp) {
        self.ops.write().push(op);
    }
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get(&self, target: &ObjectRef) -> Result<Option<serde_json::Value>> {
        let key = target.key();
        if self.failing_reads.read().contains(&key) {
            return Err(Error::Internal(format!("injected read failure for {}", target)));
        }

        let gone = match self.terminating.get_mut(&key) {
            Some(mut remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if gone {
            self.terminating.remove(&key);
            self.objects.remove(&key);
            return Ok(None);
        }
        Ok(self.objects.get(&key).map(|v| v.value().clone()))
    }

    async fn apply(&self, target: &ObjectRef, object: serde_json::Value) -> Result<()> {
        self.record(ResourceOp::Apply(target.to_string()));

        let mut stored = self
            .objects
            .entry(target.key())
            .or_insert_with(|| serde_json::json!({}));
        merge_owned(stored.value_mut(), object);
        self.stamp(stored.value_mut());
        Ok(())
    }

    async fn delete(&self, target: &ObjectRef) -> Result<DeleteOutcome> {
        let key = target.key();
        self.record(ResourceOp::Delete(target.to_string()));

        if !self.objects.contains_key(&key) {
            return Ok(DeleteOutcome::AlreadyGone);
        }
        if self.terminating.contains_key(&key) {
            return Ok(DeleteOutcome::Requested);
        }
        match self.delete_lag.load(Ordering::SeqCst) {
            0 => {
                self.objects.remove(&key);
            }
            lag => {
                self.terminating.insert(key, lag);
            }
        }
        Ok(DeleteOutcome::Requested)
    }
}

/// Server-side apply as far as the tests need it: maps merge key by key,
/// everything else is replaced by the applied value
fn merge_owned(live: &mut serde_json::Value, applied: serde_json::Value) {
    match (live, applied) {
        (serde_json::Value::Object(live), serde_json::Value::Object(applied)) => {
            for (key, value) in applied {
                match live.get_mut(&key) {
                    Some(existing) => merge_owned(existing, value),
                    None => {
                        live.insert(key, value);
                    }
                }
            }
        }
        (live, applied) => *live = applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BlockStorageSpec;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::Secret;

    fn block_storage() -> BlockStorage {
        let mut bs = BlockStorage::new("storage", BlockStorageSpec::default());
        bs.metadata.namespace = Some("default".into());
        bs
    }

    #[tokio::test]
    async fn test_stale_status_write_conflicts() {
        let store = MemoryStateStore::new();
        let key = store.insert(block_storage());
        let read = store.get(&key).await.unwrap().unwrap();

        store.touch(&key);
        assert_matches!(
            store.update_status(&read, Default::default()).await,
            Err(Error::Conflict { .. })
        );

        let fresh = store.get(&key).await.unwrap().unwrap();
        store.update_status(&fresh, Default::default()).await.unwrap();
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_finalizer_holds_deletion() {
        let store = MemoryStateStore::new();
        let key = store.insert(block_storage());

        let current = store.get(&key).await.unwrap().unwrap();
        store.set_finalizer(&current, "test/finalizer", true).await.unwrap();

        store.delete(&key);
        let deleting = store.get(&key).await.unwrap().unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        store.set_finalizer(&deleting, "test/finalizer", false).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_lag() {
        let client = MemoryResourceClient::new().with_delete_lag(2);
        let target = ObjectRef::of::<Secret>(Some("kube-system"), "creds");
        client
            .apply(&target, serde_json::json!({"metadata": {"name": "creds"}}))
            .await
            .unwrap();

        assert_eq!(client.delete(&target).await.unwrap(), DeleteOutcome::Requested);
        assert!(client.get(&target).await.unwrap().is_some());
        assert!(client.get(&target).await.unwrap().is_none());
        assert_eq!(client.delete(&target).await.unwrap(), DeleteOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_apply_keeps_foreign_fields() {
        let client = MemoryResourceClient::new();
        let target = ObjectRef::of::<Secret>(Some("kube-system"), "creds");
        client.seed(
            &target,
            serde_json::json!({
                "metadata": {"name": "creds", "labels": {"team": "storage"}},
                "data": {"jwt": "eA=="}
            }),
        );
        let before = client.snapshot(&target).unwrap()["metadata"]["resourceVersion"].clone();

        client
            .apply(
                &target,
                serde_json::json!({
                    "metadata": {"name": "creds", "labels": {"app": "csi"}},
                    "data": {"jwt": "eQ=="}
                }),
            )
            .await
            .unwrap();

        let live = client.snapshot(&target).unwrap();
        assert_eq!(live["metadata"]["labels"]["team"], "storage");
        assert_eq!(live["metadata"]["labels"]["app"], "csi");
        assert_eq!(live["data"]["jwt"], "eQ==");
        assert_ne!(live["metadata"]["resourceVersion"], before);
        assert_eq!(client.ops(), vec![ResourceOp::Apply(target.to_string())]);
    }
}
