//! BlockStorage CRD
//!
//! Declares which backend project a cluster consumes, the storage classes to
//! register for it, the global QoS policies to keep on the backend and where
//! the admin key lives.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// BlockStorage CRD
// =============================================================================

/// BlockStorage is the declared state for one backend project exposed to
/// this cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.blockstore.io",
    version = "v1",
    kind = "BlockStorage",
    plural = "blockstorages",
    shortname = "bs",
    status = "BlockStorageStatus",
    printcolumn = r#"{"name": "Project", "type": "string", "jsonPath": ".spec.projectId"}"#,
    printcolumn = r#"{"name": "Error", "type": "string", "jsonPath": ".status.lastError"}"#,
    printcolumn = r#"{"name": "Reconciled", "type": "date", "jsonPath": ".status.lastReconcileTime"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockStorageSpec {
    /// Backend project that volumes of this cluster are created in
    #[serde(default)]
    pub project_id: String,

    /// Storage classes to register
    #[serde(default)]
    pub storage_classes: Vec<StorageClassSpec>,

    /// Global QoS policies to keep on the backend
    #[serde(default)]
    pub qos_policies: Vec<QoSPolicySpec>,

    /// Reference to the admin key secret
    #[serde(default)]
    pub admin_key_ref: Option<SecretKeyRef>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// One storage class to register
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassSpec {
    /// Name of the storage class
    pub name: String,

    /// Number of replicas per volume
    pub replica_count: i32,

    /// Enable inline compression
    #[serde(default)]
    pub compression: bool,
}

/// A global QoS policy definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QoSPolicySpec {
    /// Unique policy name on the backend
    pub name: String,

    /// Free text shown by the backend
    #[serde(default)]
    pub description: String,

    /// Limit; exactly one member must be set
    #[serde(default)]
    pub limit: QoSPolicyLimitSpec,
}

/// Declared limit of a QoS policy. Only one member may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QoSPolicyLimitSpec {
    /// Bandwidth in full MB/s, 0 = unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<LimitValues>,

    /// IOPS, a power of two of at least 256, 0 = unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<LimitValues>,

    /// IOPS per GB of volume size, 0 = unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_per_gb: Option<LimitValues>,
}

/// Read and write limit values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LimitValues {
    #[serde(default)]
    pub read: u32,
    #[serde(default)]
    pub write: u32,
}

/// Reference to a key within a secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a BlockStorage, rewritten on every pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockStorageStatus {
    /// Completion time of the most recent pass
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Error of the most recent pass, if it failed
    #[serde(default)]
    pub last_error: Option<String>,

    /// Name of the secret holding the access token
    #[serde(default)]
    pub secret_ref: Option<String>,

    /// Health of the managed workloads
    #[serde(default)]
    pub managed_resource_statuses: Vec<ManagedResourceStatus>,
}

/// Health of a single managed workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    pub name: String,
    /// Group, version and kind of the workload
    pub kind: String,
    pub state: HealthState,
    pub description: String,
    #[schemars(with = "String")]
    pub last_update_time: DateTime<Utc>,
}

/// Workload health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HealthState {
    Running,
    NotRunning,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Running => write!(f, "Running"),
            HealthState::NotRunning => write!(f, "NotRunning"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockStorage {
    /// Get the name of this object
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }
}

impl BlockStorageSpec {
    /// Structural checks on the declared state
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.project_id.is_empty() {
            return Err(Error::Validation("projectId is empty".into()));
        }
        if self.storage_classes.is_empty() {
            return Err(Error::Validation(
                "at least one storage class must be defined".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for sc in &self.storage_classes {
            if sc.name.is_empty() {
                return Err(Error::Validation("storageClasses[].name is empty".into()));
            }
            if !seen.insert(sc.name.as_str()) {
                return Err(Error::Validation(format!(
                    "storage class {:?} is declared more than once",
                    sc.name
                )));
            }
            if sc.replica_count < 1 {
                return Err(Error::Validation(format!(
                    "storage class {:?}: replicaCount must be greater than 0",
                    sc.name
                )));
            }
        }

        // Policies are matched to remote ones by name
        let mut seen = std::collections::HashSet::new();
        for policy in &self.qos_policies {
            if !seen.insert(policy.name.as_str()) {
                return Err(Error::Validation(format!(
                    "qos policy {:?} is declared more than once",
                    policy.name
                )));
            }
        }
        Ok(())
    }
}

impl BlockStorageStatus {
    /// Check whether every managed workload is running
    pub fn all_running(&self) -> bool {
        self.managed_resource_statuses
            .iter()
            .all(|s| s.state == HealthState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn valid_spec() -> BlockStorageSpec {
        BlockStorageSpec {
            project_id: "project-a".into(),
            storage_classes: vec![StorageClassSpec {
                name: "partition-gold".into(),
                replica_count: 3,
                compression: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn test_missing_project() {
        let mut spec = valid_spec();
        spec.project_id.clear();
        assert_matches!(spec.validate(), Err(Error::Validation(msg)) if msg.contains("projectId"));
    }

    #[test]
    fn test_storage_class_rules() {
        let mut spec = valid_spec();
        spec.storage_classes.clear();
        assert_matches!(spec.validate(), Err(Error::Validation(_)));

        let mut spec = valid_spec();
        spec.storage_classes[0].replica_count = 0;
        assert_matches!(spec.validate(), Err(Error::Validation(msg)) if msg.contains("replicaCount"));

        let mut spec = valid_spec();
        spec.storage_classes[0].name.clear();
        assert_matches!(spec.validate(), Err(Error::Validation(_)));

        let mut spec = valid_spec();
        spec.storage_classes.push(spec.storage_classes[0].clone());
        assert_matches!(
            spec.validate(),
            Err(Error::Validation(msg)) if msg.contains("\"partition-gold\" is declared more than once")
        );
    }

    #[test]
    fn test_duplicate_policy_names() {
        let policy = |description: &str| QoSPolicySpec {
            name: "floppy-policy".into(),
            description: description.into(),
            limit: QoSPolicyLimitSpec {
                bandwidth: Some(LimitValues { read: 15, write: 15 }),
                ..Default::default()
            },
        };

        let mut spec = valid_spec();
        spec.qos_policies = vec![policy("slow")];
        assert!(spec.validate().is_ok());

        spec.qos_policies.push(policy("slower"));
        assert_matches!(
            spec.validate(),
            Err(Error::Validation(msg)) if msg.contains("\"floppy-policy\" is declared more than once")
        );
    }

    #[test]
    fn test_spec_wire_format() {
        let spec: BlockStorageSpec = serde_json::from_value(serde_json::json!({
            "projectId": "project-a",
            "storageClasses": [{"name": "silver", "replicaCount": 2, "compression": true}],
            "qosPolicies": [{
                "name": "floppy-policy",
                "description": "Unbearably slow",
                "limit": {"bandwidth": {"read": 15, "write": 15}}
            }],
            "adminKeyRef": {"name": "admin-key"}
        }))
        .unwrap();

        assert!(spec.validate().is_ok());
        assert_eq!(spec.storage_classes[0].replica_count, 2);
        assert_eq!(
            spec.qos_policies[0].limit.bandwidth,
            Some(LimitValues { read: 15, write: 15 })
        );
        assert!(spec.qos_policies[0].limit.iops.is_none());
    }
}
