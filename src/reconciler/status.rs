//! Status reporting
//!
//! The status of a `BlockStorage` is rebuilt from scratch at the end of every
//! pass and written with optimistic concurrency. Conflicts are retried on a
//! fresh read a bounded number of times; a write that still fails is logged
//! and dropped since it only affects observability.

use crate::crd::{BlockStorageStatus, ManagedResourceStatus};
use crate::domain::ports::{DeclaredStateStore, StateKey};
use crate::error::Error;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// What happened to a status write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Written { attempts: u32 },
    /// The object disappeared before the write
    Gone,
    /// Given up; the pass result is unaffected
    Dropped,
}

/// Build the status reported for a finished pass
pub fn pass_status(
    now: DateTime<Utc>,
    error: Option<&Error>,
    secret_ref: Option<String>,
    workloads: Vec<ManagedResourceStatus>,
) -> BlockStorageStatus {
    BlockStorageStatus {
        last_reconcile_time: Some(now),
        last_error: error.map(ToString::to_string),
        secret_ref,
        managed_resource_statuses: workloads,
    }
}

/// Write `status`, re-reading the object before every attempt
pub async fn write_status(
    store: &dyn DeclaredStateStore,
    key: &StateKey,
    status: BlockStorageStatus,
    attempts: u32,
) -> StatusWrite {
    for attempt in 1..=attempts.max(1) {
        let current = match store.get(key).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(%key, "object gone, skipping status write");
                return StatusWrite::Gone;
            }
            Err(e) => {
                warn!(%key, error = %e, "failed to read object for status write");
                return StatusWrite::Dropped;
            }
        };

        match store.update_status(&current, status.clone()).await {
            Ok(()) => return StatusWrite::Written { attempts: attempt },
            Err(e) if e.is_conflict() => {
                debug!(%key, attempt, "status write conflicted, retrying");
            }
            Err(e) if e.is_not_found() => return StatusWrite::Gone,
            Err(e) => {
                warn!(%key, error = %e, "failed to write status");
                return StatusWrite::Dropped;
            }
        }
    }

    warn!(%key, attempts, "dropping status write after repeated conflicts");
    StatusWrite::Dropped
}
