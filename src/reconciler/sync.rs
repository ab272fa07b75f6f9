//! Managed-resource synchronisation
//!
//! Every platform object goes through [`apply_owned`]: the desired document
//! holds only the fields this operator owns and is written with server-side
//! apply. The write is skipped when the live object already carries every
//! owned field, so defaults filled in by the API server never count as drift.

use crate::crd::{HealthState, ManagedResourceStatus, StorageClassSpec};
use crate::domain::ports::{ObjectRef, ResourceClient};
use crate::error::Result;
use crate::manifests::{name_of, ManagedManifests, CONTROLLER_NAME, NODE_NAME};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::{CSIDriver, StorageClass};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

// =============================================================================
// Apply
// =============================================================================

/// What [`apply_owned`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationResult::Created => write!(f, "created"),
            OperationResult::Updated => write!(f, "updated"),
            OperationResult::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Ensure the object `name` carries every field set in `desired`.
///
/// `desired` must only populate the fields this operator owns. Fields set by
/// others, including server-side defaults, are left alone.
pub async fn apply_owned<K>(
    client: &dyn ResourceClient,
    namespace: Option<&str>,
    name: &str,
    mut desired: K,
) -> Result<OperationResult>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let target = ObjectRef::of::<K>(namespace, name);

    desired.meta_mut().name = Some(name.to_string());
    desired.meta_mut().namespace = namespace.map(str::to_string);
    desired.meta_mut().resource_version = None;
    let mut document = serde_json::to_value(&desired)?;
    document["apiVersion"] = Value::String(K::api_version(&()).into_owned());
    document["kind"] = Value::String(K::kind(&()).into_owned());

    let result = match client.get(&target).await? {
        None => OperationResult::Created,
        Some(live) if carries_owned_fields(&live, &document) => {
            return Ok(OperationResult::Unchanged)
        }
        Some(_) => OperationResult::Updated,
    };
    client.apply(&target, document).await?;
    Ok(result)
}

/// True when every field of `owned` is present in `live` with the same value.
///
/// Maps may hold extra keys and list items are compared position by position,
/// since defaulting adds fields but never reorders lists. An empty owned
/// map or list matches an absent field because the API server drops them.
fn carries_owned_fields(live: &Value, owned: &Value) -> bool {
    match (live, owned) {
        (Value::Object(live), Value::Object(owned)) => owned.iter().all(|(key, value)| {
            match live.get(key) {
                Some(live_value) => carries_owned_fields(live_value, value),
                None => is_empty(value),
            }
        }),
        (Value::Array(live), Value::Array(owned)) => {
            live.len() == owned.len()
                && live
                    .iter()
                    .zip(owned)
                    .all(|(l, o)| carries_owned_fields(l, o))
        }
        (Value::Null, owned) => is_empty(owned),
        (live, owned) => live == owned,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

// =============================================================================
// Managed Resources
// =============================================================================

/// Outcome of one synchronisation
#[derive(Debug, Default)]
pub struct SyncReport {
    /// `(object, result)` in write order
    pub results: Vec<(String, OperationResult)>,
}

impl SyncReport {
    fn push<K: Resource<DynamicType = ()>>(&mut self, ns: Option<&str>, name: &str, op: OperationResult) {
        let target = ObjectRef::of::<K>(ns, name);
        match op {
            OperationResult::Unchanged => debug!(object = %target, "unchanged"),
            _ => info!(object = %target, operation = %op, "applied"),
        }
        self.results.push((target.to_string(), op));
    }

    /// Number of objects that were created or updated
    pub fn changed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, op)| *op != OperationResult::Unchanged)
            .count()
    }
}

/// Apply the CSI driver objects and one storage class per declared class
pub async fn sync_managed_resources(
    client: &dyn ResourceClient,
    manifests: &ManagedManifests,
    project: &str,
    classes: &[StorageClassSpec],
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let ns = Some(manifests.namespace());

    let driver = &manifests.csi_driver;
    let name = name_of(&driver.metadata);
    let op = apply_owned(client, None, &name, driver.clone()).await?;
    report.push::<CSIDriver>(None, &name, op);

    for sa in &manifests.service_accounts {
        let name = name_of(&sa.metadata);
        let op = apply_owned(client, ns, &name, sa.clone()).await?;
        report.push::<ServiceAccount>(ns, &name, op);
    }

    for role in &manifests.cluster_roles {
        let name = name_of(&role.metadata);
        let op = apply_owned(client, None, &name, role.clone()).await?;
        report.push::<ClusterRole>(None, &name, op);
    }

    for binding in &manifests.cluster_role_bindings {
        let name = name_of(&binding.metadata);
        let op = apply_owned(client, None, &name, binding.clone()).await?;
        report.push::<ClusterRoleBinding>(None, &name, op);
    }

    let op = apply_owned(client, ns, CONTROLLER_NAME, manifests.controller.clone()).await?;
    report.push::<StatefulSet>(ns, CONTROLLER_NAME, op);

    let op = apply_owned(client, ns, NODE_NAME, manifests.node.clone()).await?;
    report.push::<DaemonSet>(ns, NODE_NAME, op);

    for class in classes {
        let desired = manifests.storage_class(project, class);
        let op = apply_owned(client, None, &class.name, desired).await?;
        report.push::<StorageClass>(None, &class.name, op);
    }

    Ok(report)
}

// =============================================================================
// Workload Health
// =============================================================================

const ALL_READY: &str = "All replicas are ready";

fn entry(
    name: &str,
    kind: &str,
    ready: i32,
    desired: i32,
    now: DateTime<Utc>,
) -> ManagedResourceStatus {
    let (state, description) = if ready == desired {
        (HealthState::Running, ALL_READY.to_string())
    } else {
        (
            HealthState::NotRunning,
            format!("{}/{} replicas are ready", ready, desired),
        )
    };
    ManagedResourceStatus {
        name: name.to_string(),
        kind: kind.to_string(),
        state,
        description,
        last_update_time: now,
    }
}

fn not_running(name: &str, kind: &str, description: String, now: DateTime<Utc>) -> ManagedResourceStatus {
    ManagedResourceStatus {
        name: name.to_string(),
        kind: kind.to_string(),
        state: HealthState::NotRunning,
        description,
        last_update_time: now,
    }
}

/// Read a workload for status; any failure is folded into a `NotRunning` entry
async fn read_workload<K>(
    client: &dyn ResourceClient,
    target: &ObjectRef,
    kind: &str,
    now: DateTime<Utc>,
) -> std::result::Result<K, ManagedResourceStatus>
where
    K: DeserializeOwned,
{
    let object = match client.get(target).await {
        Ok(Some(object)) => object,
        Ok(None) => {
            warn!(object = %target, "workload not found");
            return Err(not_running(&target.name, kind, "not found".to_string(), now));
        }
        Err(e) => {
            warn!(object = %target, error = %e, "failed to read workload");
            return Err(not_running(&target.name, kind, format!("failed to read: {}", e), now));
        }
    };
    serde_json::from_value(object).map_err(|e| {
        warn!(object = %target, error = %e, "failed to decode workload");
        not_running(&target.name, kind, format!("failed to decode: {}", e), now)
    })
}

/// Health entries for the node `DaemonSet` and the controller `StatefulSet`
pub async fn workload_statuses(
    client: &dyn ResourceClient,
    manifests: &ManagedManifests,
    now: DateTime<Utc>,
) -> Vec<ManagedResourceStatus> {
    let ns = Some(manifests.namespace());
    let mut statuses = Vec::with_capacity(2);

    let kind = "apps/v1/DaemonSet";
    let target = ObjectRef::of::<DaemonSet>(ns, NODE_NAME);
    statuses.push(match read_workload::<DaemonSet>(client, &target, kind, now).await {
        Ok(ds) => {
            let status = ds.status.unwrap_or_default();
            entry(NODE_NAME, kind, status.number_ready, status.desired_number_scheduled, now)
        }
        Err(status) => status,
    });

    let kind = "apps/v1/StatefulSet";
    let target = ObjectRef::of::<StatefulSet>(ns, CONTROLLER_NAME);
    statuses.push(match read_workload::<StatefulSet>(client, &target, kind, now).await {
        Ok(sts) => {
            let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = sts.status.and_then(|s| s.ready_replicas).unwrap_or(0);
            entry(CONTROLLER_NAME, kind, ready, desired, now)
        }
        Err(status) => status,
    });

    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{MemoryResourceClient, ResourceOp};
    use crate::config::OperatorConfig;
    use k8s_openapi::api::core::v1::Secret;
    use std::collections::BTreeMap;

    fn manifests() -> ManagedManifests {
        ManagedManifests::new(&OperatorConfig {
            endpoints: "10.0.0.1:443".parse().unwrap(),
            ..Default::default()
        })
    }

    fn classes() -> Vec<StorageClassSpec> {
        vec![StorageClassSpec {
            name: "gold".into(),
            replica_count: 3,
            compression: false,
        }]
    }

    fn secret(value: &str) -> Secret {
        Secret {
            string_data: Some(BTreeMap::from([("k".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_unchanged_then_update() {
        let client = MemoryResourceClient::new();

        let op = apply_owned(&client, Some("ns"), "s", secret("a")).await.unwrap();
        assert_eq!(op, OperationResult::Created);

        let op = apply_owned(&client, Some("ns"), "s", secret("a")).await.unwrap();
        assert_eq!(op, OperationResult::Unchanged);

        let op = apply_owned(&client, Some("ns"), "s", secret("b")).await.unwrap();
        assert_eq!(op, OperationResult::Updated);

        assert_eq!(
            client.ops(),
            vec![
                ResourceOp::Apply("Secret ns/s".into()),
                ResourceOp::Apply("Secret ns/s".into()),
            ]
        );
        let live = client.snapshot(&ObjectRef::of::<Secret>(Some("ns"), "s")).unwrap();
        assert_eq!(live["apiVersion"], "v1");
        assert_eq!(live["kind"], "Secret");
        assert_eq!(live["stringData"]["k"], "b");
    }

    #[tokio::test]
    async fn test_server_defaults_are_not_drift() {
        let client = MemoryResourceClient::new();
        let manifests = manifests();
        sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();

        // What the API server adds on admission
        let ns = Some(manifests.namespace());
        let target = ObjectRef::of::<StatefulSet>(ns, CONTROLLER_NAME);
        let mut live = client.snapshot(&target).unwrap();
        live["spec"]["revisionHistoryLimit"] = serde_json::json!(10);
        live["spec"]["podManagementPolicy"] = serde_json::json!("OrderedReady");
        live["spec"]["template"]["spec"]["dnsPolicy"] = serde_json::json!("ClusterFirst");
        live["spec"]["template"]["spec"]["containers"][0]["terminationMessagePath"] =
            serde_json::json!("/dev/termination-log");
        live["metadata"]["uid"] = serde_json::json!("8d5c2f0e");
        client.seed(&target, live);

        let target = ObjectRef::of::<DaemonSet>(ns, NODE_NAME);
        let mut live = client.snapshot(&target).unwrap();
        live["spec"]["updateStrategy"] = serde_json::json!({
            "type": "RollingUpdate",
            "rollingUpdate": {"maxUnavailable": 1, "maxSurge": 0}
        });
        live["spec"]["template"]["spec"]["schedulerName"] = serde_json::json!("default-scheduler");
        client.seed(&target, live);

        client.clear_ops();
        let report = sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();
        assert_eq!(report.changed(), 0);
        assert!(client.ops().is_empty());
    }

    #[test]
    fn test_owned_field_comparison() {
        let owned = serde_json::json!({
            "metadata": {"labels": {"app": "csi"}, "annotations": {}},
            "spec": {"containers": [{"name": "a", "args": ["-v"]}]}
        });

        let live = serde_json::json!({
            "metadata": {"labels": {"app": "csi", "zone": "a"}, "uid": "1"},
            "spec": {"containers": [{"name": "a", "args": ["-v"], "imagePullPolicy": "Always"}]}
        });
        assert!(carries_owned_fields(&live, &owned));

        let reordered = serde_json::json!({
            "metadata": {"labels": {"app": "csi"}},
            "spec": {"containers": [{"name": "a", "args": ["-v", "-x"]}]}
        });
        assert!(!carries_owned_fields(&reordered, &owned));

        let relabelled = serde_json::json!({
            "metadata": {"labels": {"app": "other"}},
            "spec": {"containers": [{"name": "a", "args": ["-v"]}]}
        });
        assert!(!carries_owned_fields(&relabelled, &owned));
    }

    #[tokio::test]
    async fn test_foreign_labels_survive() {
        let client = MemoryResourceClient::new();
        let manifests = manifests();
        sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();

        let target = ObjectRef::of::<StorageClass>(None, "gold");
        let mut live = client.snapshot(&target).unwrap();
        live["metadata"]["labels"]["platform.io/zone"] = serde_json::json!("a");
        live["parameters"]["replica-count"] = serde_json::json!("1");
        client.seed(&target, live);

        sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();
        let live = client.snapshot(&target).unwrap();
        assert_eq!(live["metadata"]["labels"]["platform.io/zone"], "a");
        assert_eq!(live["parameters"]["replica-count"], "3");
    }

    #[tokio::test]
    async fn test_second_sync_changes_nothing() {
        let client = MemoryResourceClient::new();
        let manifests = manifests();

        let first = sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();
        assert_eq!(first.changed(), first.results.len());

        client.clear_ops();
        let second = sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();
        assert_eq!(second.changed(), 0);
        assert!(client.ops().is_empty());
    }

    #[tokio::test]
    async fn test_workload_statuses() {
        let client = MemoryResourceClient::new();
        let manifests = manifests();
        let now = Utc::now();

        // Nothing deployed yet
        let statuses = workload_statuses(&client, &manifests, now).await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == HealthState::NotRunning));

        sync_managed_resources(&client, &manifests, "project-a", &classes())
            .await
            .unwrap();
        let ns = Some(manifests.namespace());
        client.set_status(
            &ObjectRef::of::<DaemonSet>(ns, NODE_NAME),
            serde_json::json!({
                "numberReady": 2, "desiredNumberScheduled": 3,
                "currentNumberScheduled": 3, "numberMisscheduled": 0
            }),
        );
        client.set_status(
            &ObjectRef::of::<StatefulSet>(ns, CONTROLLER_NAME),
            serde_json::json!({"replicas": 1, "readyReplicas": 1}),
        );

        let statuses = workload_statuses(&client, &manifests, now).await;
        assert_eq!(statuses[0].state, HealthState::NotRunning);
        assert_eq!(statuses[0].description, "2/3 replicas are ready");
        assert_eq!(statuses[1].state, HealthState::Running);
        assert_eq!(statuses[1].description, ALL_READY);
    }

    #[tokio::test]
    async fn test_failed_workload_read_is_downgraded() {
        let client = MemoryResourceClient::new();
        let manifests = manifests();
        client.fail_reads(&ObjectRef::of::<DaemonSet>(Some(manifests.namespace()), NODE_NAME));

        let statuses = workload_statuses(&client, &manifests, Utc::now()).await;
        assert_eq!(statuses[0].state, HealthState::NotRunning);
        assert!(statuses[0].description.starts_with("failed to read"));
    }
}
