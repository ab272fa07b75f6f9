//! Error types for the block-storage operator
//!
//! Provides structured error types for every reconciliation step: declared
//! state validation, backend connector calls, key material and token
//! handling, platform object writes and status reporting.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Declared State Errors
    // =========================================================================
    #[error("Declared state validation failed: {0}")]
    Validation(String),

    #[error("Invalid limit for qos policy {policy:?}: {reason}")]
    PolicyLimit { policy: String, reason: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Conflict writing {kind}/{name}: object was modified concurrently")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    #[error("Backend transport error: {0}")]
    BackendHttp(#[from] reqwest::Error),

    // =========================================================================
    // Credential Errors
    // =========================================================================
    #[error("Admin key error: {0}")]
    KeyMaterial(String),

    #[error("Access token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    // =========================================================================
    // Control Loop Errors
    // =========================================================================
    #[error("Reconcile step {step} exceeded the pass deadline")]
    Timeout { step: String },

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a backend error for a named connector operation
    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Join a list of per-item failures. Returns `None` when the list is empty
    /// and the single error itself when there is only one.
    pub fn join(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::BackendHttp(_)
            | Error::Kube(_)
            | Error::BackendUnavailable { .. }
            | Error::Timeout { .. } => ErrorAction::RequeueWithBackoff,

            // Lost an optimistic-concurrency race - re-read soon
            Error::Conflict { .. } => ErrorAction::RequeueAfter(Duration::from_secs(1)),

            // Declared state can be corrected externally at any time
            Error::Validation(_) | Error::PolicyLimit { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Process configuration does not change without a restart
            Error::Configuration(_) | Error::KeyMaterial(_) => ErrorAction::NoRequeue,

            Error::Aggregate(errors) => {
                if errors.iter().any(Error::is_transient) {
                    ErrorAction::RequeueWithBackoff
                } else {
                    ErrorAction::RequeueAfter(Duration::from_secs(30))
                }
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendHttp(_)
                | Error::Kube(_)
                | Error::BackendUnavailable { .. }
                | Error::Timeout { .. }
        )
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
