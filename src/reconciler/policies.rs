//! QoS policy ensurer
//!
//! Converges the global rate-limit policies on the backend to the declared
//! list. Policies scoped to projects belong to other tenants and are never
//! touched. Every item is processed even if a sibling fails; the failures
//! are returned joined.

use crate::crd::QoSPolicySpec;
use crate::domain::ports::{BackendConnector, PolicyRequest, PolicyVisibility, RemotePolicy};
use crate::domain::qos::QoSPolicyDef;
use crate::error::{Error, Result};
use crate::metrics::ReconcileMetrics;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Counts of the mutations a run issued
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl PolicyReport {
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }
}

pub struct PolicyEnsurer<'a> {
    backend: &'a dyn BackendConnector,
    metrics: Option<&'a ReconcileMetrics>,
}

impl<'a> PolicyEnsurer<'a> {
    pub fn new(backend: &'a dyn BackendConnector) -> Self {
        Self {
            backend,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'a ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Converge the backend's global policies to `desired`.
    ///
    /// A failing list aborts immediately. Any other failure is collected
    /// and the remaining items are still processed; the report describes the
    /// mutations that succeeded.
    pub async fn ensure_policies(&self, desired: &[QoSPolicySpec]) -> (PolicyReport, Result<()>) {
        let mut report = PolicyReport::default();

        let mut existing: BTreeMap<String, RemotePolicy> = match self.backend.list_policies().await {
            Ok(policies) => policies
                .into_iter()
                .filter(RemotePolicy::is_owned)
                .map(|p| (p.name.clone(), p))
                .collect(),
            Err(e) => return (report, Err(e)),
        };

        let mut errors = Vec::new();
        for spec in desired {
            // claimed policies survive the deletion sweep even if they
            // cannot be converted
            let current = existing.remove(&spec.name);

            let def = match QoSPolicyDef::try_from(spec) {
                Ok(def) => def,
                Err(e) => {
                    warn!(policy = %spec.name, error = %e, "skipping qos policy");
                    errors.push(e);
                    continue;
                }
            };

            let result = match current {
                None => self.create(&def, &mut report).await,
                Some(current) => self.update(&current, &def, &mut report).await,
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }

        for (name, leftover) in existing {
            info!(policy = %name, id = %leftover.id, "deleting undeclared qos policy");
            let result = self.backend.delete_policy(&leftover.id, &name).await;
            self.record("delete", result.is_ok());
            match result {
                Ok(()) => report.deleted.push(name),
                Err(e) => errors.push(e),
            }
        }

        match Error::join(errors) {
            Some(e) => (report, Err(e)),
            None => (report, Ok(())),
        }
    }

    async fn create(&self, def: &QoSPolicyDef, report: &mut PolicyReport) -> Result<()> {
        info!(policy = %def.name, limit = %def.limit, "creating qos policy");
        let result = self.backend.create_policy(&request(def)).await;
        self.record("create", result.is_ok());
        result?;
        report.created.push(def.name.clone());
        Ok(())
    }

    async fn update(
        &self,
        current: &RemotePolicy,
        def: &QoSPolicyDef,
        report: &mut PolicyReport,
    ) -> Result<()> {
        if current.description == def.description && current.limit == Some(def.limit) {
            debug!(policy = %def.name, "qos policy up to date");
            report.unchanged.push(def.name.clone());
            return Ok(());
        }

        info!(policy = %def.name, id = %current.id, limit = %def.limit, "updating qos policy");
        let result = self.backend.update_policy(&current.id, &request(def)).await;
        self.record("update", result.is_ok());
        result?;
        report.updated.push(def.name.clone());
        Ok(())
    }

    fn record(&self, op: &str, ok: bool) {
        if let Some(metrics) = self.metrics {
            metrics.policy_operation(op, ok);
        }
    }
}

fn request(def: &QoSPolicyDef) -> PolicyRequest {
    PolicyRequest {
        name: def.name.clone(),
        description: def.description.clone(),
        visibility: PolicyVisibility::Global,
        limit: def.limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendCall, BackendOperation, MemoryBackend};
    use crate::crd::{LimitValues, QoSPolicyLimitSpec};
    use crate::domain::ports::PolicyState;
    use crate::domain::qos::{QoSLimit, ReadWrite};
    use assert_matches::assert_matches;

    fn bandwidth(name: &str, read: u32, write: u32) -> QoSPolicySpec {
        QoSPolicySpec {
            name: name.into(),
            description: format!("{} limit", name),
            limit: QoSPolicyLimitSpec {
                bandwidth: Some(LimitValues { read, write }),
                ..Default::default()
            },
        }
    }

    fn remote(id: &str, name: &str, visibility: PolicyVisibility, limit: QoSLimit) -> RemotePolicy {
        RemotePolicy {
            id: id.into(),
            name: name.into(),
            description: format!("{} limit", name),
            visibility,
            limit: Some(limit),
            state: PolicyState::Active,
        }
    }

    #[tokio::test]
    async fn test_creates_missing_policy() {
        let backend = MemoryBackend::new();
        let (report, result) = PolicyEnsurer::new(&backend)
            .ensure_policies(&[bandwidth("floppy-policy", 15, 15)])
            .await;
        result.unwrap();

        assert_eq!(
            backend.mutations(),
            vec![BackendCall::CreatePolicy(PolicyRequest {
                name: "floppy-policy".into(),
                description: "floppy-policy limit".into(),
                visibility: PolicyVisibility::Global,
                limit: QoSLimit::Bandwidth(ReadWrite::new(15, 15)),
            })]
        );
        assert_eq!(report.created, vec!["floppy-policy".to_string()]);
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_deletes_undeclared_global_policy() {
        let backend = MemoryBackend::new().with_policy(remote(
            "uuid-other",
            "other-policy",
            PolicyVisibility::Global,
            QoSLimit::Iops(ReadWrite::new(256, 256)),
        ));

        let (_, result) = PolicyEnsurer::new(&backend)
            .ensure_policies(&[bandwidth("floppy-policy", 15, 15)])
            .await;
        result.unwrap();

        let mutations = backend.mutations();
        assert_eq!(mutations.len(), 2);
        assert_matches!(&mutations[0], BackendCall::CreatePolicy(r) if r.name == "floppy-policy");
        assert_eq!(
            mutations[1],
            BackendCall::DeletePolicy {
                id: "uuid-other".into(),
                name: "other-policy".into()
            }
        );
    }

    #[tokio::test]
    async fn test_scoped_policies_are_never_touched() {
        let customer = remote(
            "uuid-customer",
            "customer-policy",
            PolicyVisibility::Scoped {
                projects: vec!["tenant-b".into()],
            },
            QoSLimit::IopsPerGb(ReadWrite::new(3, 3)),
        );
        let backend = MemoryBackend::new().with_policy(customer.clone());

        let (report, result) = PolicyEnsurer::new(&backend).ensure_policies(&[]).await;
        result.unwrap();

        assert!(!report.changed());
        assert!(backend.mutations().is_empty());
        assert_eq!(backend.policies(), vec![customer]);
    }

    #[tokio::test]
    async fn test_scoped_policy_with_declared_name_is_not_claimed() {
        let backend = MemoryBackend::new().with_policy(remote(
            "uuid-customer",
            "shared-name",
            PolicyVisibility::Scoped {
                projects: vec!["tenant-b".into()],
            },
            QoSLimit::Bandwidth(ReadWrite::new(1, 1)),
        ));

        let (_, result) = PolicyEnsurer::new(&backend)
            .ensure_policies(&[bandwidth("shared-name", 15, 15)])
            .await;

        // the backend refuses the duplicate name, the scoped policy stays
        assert_matches!(result, Err(Error::Backend { operation, .. }) if operation == "CreatePolicy");
        assert!(!backend
            .mutations()
            .iter()
            .any(|c| matches!(c, BackendCall::UpdatePolicy { .. } | BackendCall::DeletePolicy { .. })));
    }

    #[tokio::test]
    async fn test_updates_only_drifted_policies() {
        let backend = MemoryBackend::new()
            .with_policy(remote(
                "uuid-a",
                "a",
                PolicyVisibility::Global,
                QoSLimit::Bandwidth(ReadWrite::new(10, 10)),
            ))
            .with_policy(remote(
                "uuid-b",
                "b",
                PolicyVisibility::Global,
                QoSLimit::Bandwidth(ReadWrite::new(20, 20)),
            ));

        let (report, result) = PolicyEnsurer::new(&backend)
            .ensure_policies(&[bandwidth("a", 10, 10), bandwidth("b", 40, 40)])
            .await;
        result.unwrap();

        assert_eq!(report.unchanged, vec!["a".to_string()]);
        assert_eq!(report.updated, vec!["b".to_string()]);
        assert_matches!(
            backend.mutations().as_slice(),
            [BackendCall::UpdatePolicy { id, request }]
                if id == "uuid-b" && request.limit == QoSLimit::Bandwidth(ReadWrite::new(40, 40))
        );
    }

    #[tokio::test]
    async fn test_converges_to_declared_set() {
        let backend = MemoryBackend::new()
            .with_policy(remote(
                "uuid-1",
                "stale",
                PolicyVisibility::Global,
                QoSLimit::Bandwidth(ReadWrite::new(1, 1)),
            ))
            .with_policy(remote(
                "uuid-2",
                "keep",
                PolicyVisibility::Global,
                QoSLimit::IopsPerGb(ReadWrite::new(1, 1)),
            ));
        let desired = vec![bandwidth("keep", 100, 200), bandwidth("fresh", 5, 5)];

        let (_, result) = PolicyEnsurer::new(&backend).ensure_policies(&desired).await;
        result.unwrap();

        let mut global: Vec<(String, Option<QoSLimit>)> = backend
            .policies()
            .into_iter()
            .filter(RemotePolicy::is_owned)
            .map(|p| (p.name, p.limit))
            .collect();
        global.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            global,
            vec![
                ("fresh".to_string(), Some(QoSLimit::Bandwidth(ReadWrite::new(5, 5)))),
                ("keep".to_string(), Some(QoSLimit::Bandwidth(ReadWrite::new(100, 200)))),
            ]
        );

        // a second run has nothing left to do
        backend.clear_calls();
        let (report, result) = PolicyEnsurer::new(&backend).ensure_policies(&desired).await;
        result.unwrap();
        assert!(!report.changed());
        assert_eq!(backend.calls(), vec![BackendCall::ListPolicies]);
    }

    #[tokio::test]
    async fn test_invalid_limit_fails_only_that_item() {
        let backend = MemoryBackend::new().with_policy(remote(
            "uuid-broken",
            "broken",
            PolicyVisibility::Global,
            QoSLimit::Bandwidth(ReadWrite::new(1, 1)),
        ));
        let broken = QoSPolicySpec {
            name: "broken".into(),
            description: String::new(),
            limit: QoSPolicyLimitSpec::default(),
        };
        let desired = vec![broken, bandwidth("fine", 1, 1)];

        let (report, result) = PolicyEnsurer::new(&backend).ensure_policies(&desired).await;

        assert_matches!(result, Err(Error::PolicyLimit { policy, .. }) if policy == "broken");
        assert_eq!(report.created, vec!["fine".to_string()]);
        // the invalid declaration still claims its remote counterpart
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_item_failures_are_joined() {
        let backend = MemoryBackend::new().with_policy(remote(
            "uuid-old",
            "old",
            PolicyVisibility::Global,
            QoSLimit::Bandwidth(ReadWrite::new(1, 1)),
        ));
        backend.fail_on(BackendOperation::CreatePolicy, "first");
        backend.fail_on(BackendOperation::DeletePolicy, "old");
        let metrics = ReconcileMetrics::unregistered().unwrap();

        let (report, result) = PolicyEnsurer::new(&backend)
            .with_metrics(&metrics)
            .ensure_policies(&[bandwidth("first", 1, 1), bandwidth("second", 2, 2)])
            .await;

        assert_matches!(result, Err(Error::Aggregate(errors)) if errors.len() == 2);
        assert_eq!(report.created, vec!["second".to_string()]);
        assert_eq!(metrics.policy_operations("create", false), 1);
        assert_eq!(metrics.policy_operations("create", true), 1);
        assert_eq!(metrics.policy_operations("delete", false), 1);
    }

    #[tokio::test]
    async fn test_list_failure_aborts() {
        let backend = MemoryBackend::new();
        backend.fail_on(BackendOperation::ListPolicies, "");

        let (report, result) = PolicyEnsurer::new(&backend)
            .ensure_policies(&[bandwidth("floppy-policy", 15, 15)])
            .await;

        assert_matches!(result, Err(Error::Backend { operation, .. }) if operation == "ListPolicies");
        assert_eq!(report, PolicyReport::default());
        assert!(backend.mutations().is_empty());
    }
}
