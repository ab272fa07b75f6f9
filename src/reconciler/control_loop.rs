//! Reconcile control loop
//!
//! One pass drives a `BlockStorage` through a fixed pipeline:
//!
//! ```text
//! Validate -> EnsureProject -> EnsureCredential -> EnsureToken
//!          -> EnsurePolicies -> SyncManagedResources -> ReportStatus
//! ```
//!
//! Each step is idempotent and feeds its output to the next one. The first
//! failing step ends the pass; the status is written regardless and the
//! object is requeued after a fixed interval. Steps share one deadline so a
//! hanging backend cannot stall a pass forever.

use crate::auth::AdminKey;
use crate::config::OperatorConfig;
use crate::crd::BlockStorage;
use crate::domain::ports::{
    BackendConnectorRef, DeclaredStateStoreRef, DeleteOutcome, ObjectRef, ResourceClientRef,
    StateKey,
};
use crate::error::{Error, Result};
use crate::manifests::ManagedManifests;
use crate::metrics::ReconcileMetrics;
use crate::reconciler::credentials::{ensure_credential, ensure_project};
use crate::reconciler::policies::PolicyEnsurer;
use crate::reconciler::status::{pass_status, write_status, StatusWrite};
use crate::reconciler::sync::{sync_managed_resources, workload_statuses};
use crate::reconciler::token::{TokenManager, TokenOutcome};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Finalizer guarding cleanup of the platform objects
pub const FINALIZER: &str = "storage.blockstore.io/finalizer";

/// Steps of a reconcile pass, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    EnsureProject,
    EnsureCredential,
    EnsureToken,
    EnsurePolicies,
    SyncManagedResources,
    ReportStatus,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Validate => "Validate",
            Step::EnsureProject => "EnsureProject",
            Step::EnsureCredential => "EnsureCredential",
            Step::EnsureToken => "EnsureToken",
            Step::EnsurePolicies => "EnsurePolicies",
            Step::SyncManagedResources => "SyncManagedResources",
            Step::ReportStatus => "ReportStatus",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one pass
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// When to run the next pass; `None` waits for a change of the object
    pub requeue_after: Option<Duration>,
    /// The step that ended the pass early
    pub failed_step: Option<Step>,
    /// Error recorded in the status
    pub error: Option<Error>,
}

impl ReconcileOutcome {
    fn idle() -> Self {
        Self {
            requeue_after: None,
            failed_step: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Data gathered while a pass progresses
#[derive(Debug, Default)]
struct PassProgress {
    secret_ref: Option<String>,
}

/// Drives declared `BlockStorage` objects toward their desired state
pub struct Reconciler {
    backend: BackendConnectorRef,
    store: DeclaredStateStoreRef,
    resources: ResourceClientRef,
    manifests: ManagedManifests,
    tokens: TokenManager,
    config: OperatorConfig,
    metrics: Option<Arc<ReconcileMetrics>>,
}

impl Reconciler {
    pub fn new(
        backend: BackendConnectorRef,
        store: DeclaredStateStoreRef,
        resources: ResourceClientRef,
        admin_key: Arc<AdminKey>,
        config: OperatorConfig,
    ) -> Self {
        let manifests = ManagedManifests::new(&config);
        let tokens = TokenManager::new(resources.clone(), admin_key, &config);
        Self {
            backend,
            store,
            resources,
            manifests,
            tokens,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ReconcileMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run one pass for `key`.
    ///
    /// Pass failures are reported in the status and in the returned outcome.
    /// `Err` is returned only when the declared state could not be read or
    /// its finalizer could not be written.
    pub async fn reconcile(&self, key: &StateKey) -> Result<ReconcileOutcome> {
        self.reconcile_at(key, Utc::now()).await
    }

    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile_at(&self, key: &StateKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        if key.namespace != self.config.namespace {
            debug!(namespace = %self.config.namespace, "ignoring object outside the watched namespace");
            return Ok(ReconcileOutcome::idle());
        }

        let Some(declared) = self.store.get(key).await? else {
            info!("no declared state found");
            return Ok(ReconcileOutcome::idle());
        };

        if declared.metadata.deletion_timestamp.is_some() {
            return self.finalize(&declared).await;
        }
        if !declared.finalizers().iter().any(|f| f == FINALIZER) {
            debug!("adding finalizer");
            self.store.set_finalizer(&declared, FINALIZER, true).await?;
        }

        let started = Instant::now();
        let deadline = started + self.config.pass_timeout;
        let mut progress = PassProgress::default();

        let failure = self.run_pipeline(&declared, now, deadline, &mut progress).await.err();

        let workloads = workload_statuses(self.resources.as_ref(), &self.manifests, now).await;
        let status = pass_status(
            now,
            failure.as_ref().map(|(_, e)| e),
            progress.secret_ref,
            workloads,
        );
        let workloads_running = status.all_running();
        let written = write_status(
            self.store.as_ref(),
            key,
            status,
            self.config.status_write_attempts,
        )
        .await;
        debug!(?written, "status reported");
        if written == StatusWrite::Dropped {
            if let Some(metrics) = &self.metrics {
                metrics.step_failed(Step::ReportStatus.as_str());
            }
        }

        let outcome = match failure {
            None => {
                info!(workloads_running, "reconcile pass succeeded");
                ReconcileOutcome {
                    requeue_after: Some(self.config.requeue_interval),
                    failed_step: None,
                    error: None,
                }
            }
            Some((step, error)) => {
                warn!(%step, error = %error, "reconcile pass failed");
                let requeue_after = if step == Step::Validate {
                    self.config.validation_requeue_interval
                } else {
                    self.config.requeue_interval
                };
                if let Some(metrics) = &self.metrics {
                    metrics.step_failed(step.as_str());
                }
                ReconcileOutcome {
                    requeue_after: Some(requeue_after),
                    failed_step: Some(step),
                    error: Some(error),
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            let result = match outcome.failed_step {
                None => "success",
                Some(Step::Validate) => "invalid",
                Some(_) => "error",
            };
            metrics.observe_pass(result, started.elapsed());
        }
        Ok(outcome)
    }

    async fn run_pipeline(
        &self,
        declared: &BlockStorage,
        now: DateTime<Utc>,
        deadline: Instant,
        progress: &mut PassProgress,
    ) -> std::result::Result<(), (Step, Error)> {
        let spec = &declared.spec;

        run_step(Step::Validate, deadline, async { spec.validate() }).await?;
        let project_id = spec.project_id.as_str();

        let project = run_step(
            Step::EnsureProject,
            deadline,
            ensure_project(self.backend.as_ref(), project_id),
        )
        .await?;

        let credential = run_step(
            Step::EnsureCredential,
            deadline,
            ensure_credential(self.backend.as_ref(), &project.name, self.tokens.admin_key()),
        )
        .await?;

        let token = run_step(
            Step::EnsureToken,
            deadline,
            self.tokens.ensure_token(&credential, now),
        )
        .await?;
        if let (TokenOutcome::Issued { reason, .. }, Some(metrics)) = (&token, &self.metrics) {
            metrics.token_rotated(reason.as_str());
        }
        progress.secret_ref = Some(self.tokens.secret_name().to_string());

        let ensurer = PolicyEnsurer::new(self.backend.as_ref());
        let ensurer = match self.metrics.as_deref() {
            Some(metrics) => ensurer.with_metrics(metrics),
            None => ensurer,
        };
        run_step(Step::EnsurePolicies, deadline, async {
            let (report, result) = ensurer.ensure_policies(&spec.qos_policies).await;
            if report.changed() {
                info!(
                    created = report.created.len(),
                    updated = report.updated.len(),
                    deleted = report.deleted.len(),
                    "qos policies converged"
                );
            }
            result
        })
        .await?;

        let report = run_step(
            Step::SyncManagedResources,
            deadline,
            sync_managed_resources(
                self.resources.as_ref(),
                &self.manifests,
                &project.name,
                &spec.storage_classes,
            ),
        )
        .await?;
        debug!(changed = report.changed(), "managed resources synced");

        Ok(())
    }

    /// Remove the platform objects of a deleted object, then release it.
    /// The backend project and credential are left in place.
    async fn finalize(&self, declared: &BlockStorage) -> Result<ReconcileOutcome> {
        if !declared.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(ReconcileOutcome::idle());
        }

        info!("cleaning up managed resources");
        if let Err(error) = self.cleanup(declared).await {
            warn!(error = %error, "cleanup failed");
            return Ok(ReconcileOutcome {
                requeue_after: Some(self.config.requeue_interval),
                failed_step: None,
                error: Some(error),
            });
        }

        self.store.set_finalizer(declared, FINALIZER, false).await?;
        info!("finalizer removed");
        Ok(ReconcileOutcome::idle())
    }

    async fn cleanup(&self, declared: &BlockStorage) -> Result<()> {
        let ns = Some(self.manifests.namespace());

        let mut targets: Vec<ObjectRef> = declared
            .spec
            .storage_classes
            .iter()
            .map(|class| ObjectRef::of::<StorageClass>(None, &class.name))
            .collect();
        targets.push(ObjectRef::of::<Secret>(ns, self.tokens.secret_name()));
        targets.extend(self.manifests.object_refs().into_iter().rev());

        let mut errors = Vec::new();
        for target in &targets {
            match self.resources.delete(target).await {
                Ok(DeleteOutcome::Requested) => info!(object = %target, "deleted"),
                Ok(DeleteOutcome::AlreadyGone) => debug!(object = %target, "already gone"),
                Err(e) if e.is_not_found() => debug!(object = %target, "already gone"),
                Err(e) => errors.push(e),
            }
        }
        match Error::join(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run one step within the pass deadline
async fn run_step<T, F>(step: Step, deadline: Instant, fut: F) -> std::result::Result<T, (Step, Error)>
where
    F: Future<Output = Result<T>>,
{
    let timeout = || Error::Timeout {
        step: step.to_string(),
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err((step, timeout()));
    }

    debug!(%step, "running step");
    match tokio::time::timeout(remaining, fut).await {
        Ok(result) => result.map_err(|e| (step, e)),
        Err(_) => Err((step, timeout())),
    }
}
