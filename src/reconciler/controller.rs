//! Kubernetes controller glue
//!
//! Watches `BlockStorage` objects in the configured namespace and hands each
//! trigger to the [`Reconciler`]. The controller runtime guarantees at most
//! one pass per object at a time.

use crate::crd::BlockStorage;
use crate::domain::ports::StateKey;
use crate::error::{Error, ErrorAction, Result};
use crate::reconciler::control_loop::Reconciler;
use futures::StreamExt;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Server side watch timeout, below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

async fn reconcile(object: Arc<BlockStorage>, ctx: Arc<Reconciler>) -> Result<Action> {
    let key = StateKey::new(object.namespace().unwrap_or_default(), object.name_any());
    let outcome = ctx.reconcile(&key).await?;

    Ok(match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(object: Arc<BlockStorage>, err: &Error, ctx: Arc<Reconciler>) -> Action {
    warn!(name = %object.name_any(), error = %err, "reconcile failed");
    match err.action() {
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::RequeueWithBackoff => Action::requeue(ctx.config().requeue_interval),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

/// Run the controller until a termination signal arrives
pub async fn run(client: Client, reconciler: Arc<Reconciler>) -> Result<()> {
    let namespace = reconciler.config().namespace.clone();
    let objects: Api<BlockStorage> = Api::namespaced(client, &namespace);

    // Fail early on a missing CRD instead of retrying the watch forever
    objects
        .list(&Default::default())
        .await
        .map_err(|e| Error::Configuration(format!("cannot list BlockStorage objects: {}", e)))?;

    info!(%namespace, "starting BlockStorage controller");
    Controller::new(objects, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((object, action)) => debug!(object = %object.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    info!("BlockStorage controller stopped");
    Ok(())
}

