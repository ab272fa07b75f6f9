//! Reconciliation
//!
//! - [`control_loop`]: the per-object pipeline and its outcome
//! - [`credentials`]: backend project and credential
//! - [`token`]: access token secret lifecycle
//! - [`policies`]: global QoS policy convergence
//! - [`sync`]: server-side apply of platform objects and workload health
//! - [`status`]: status assembly and conflict-tolerant writes
//! - [`controller`]: kube-runtime controller wiring

pub mod control_loop;
pub mod controller;
pub mod credentials;
pub mod policies;
pub mod status;
pub mod sync;
pub mod token;

pub use control_loop::{ReconcileOutcome, Reconciler, Step, FINALIZER};
pub use policies::{PolicyEnsurer, PolicyReport};
pub use sync::{apply_owned, OperationResult};
pub use token::{RotationReason, TokenManager, TokenOutcome};
