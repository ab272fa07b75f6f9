//! Operator configuration
//!
//! Runtime settings for the reconcile loop, the token lifetime policy and the
//! backend endpoint lists. Populated from CLI flags in `main.rs`.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default CSI provisioner registered for the backend
pub const DEFAULT_PROVISIONER: &str = "csi.lightbitslabs.com";

/// Default name of the secret holding the signed access token
pub const DEFAULT_TOKEN_SECRET: &str = "blockstore-csi-creds";

/// Field manager recorded on platform objects written by the operator
pub const FIELD_MANAGER: &str = "blockstore-operator";

// =============================================================================
// Token Policy
// =============================================================================

/// Lifetime policy for issued access tokens
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    /// Validity of a freshly issued token
    pub lifetime: chrono::Duration,
    /// A token is rotated once it is closer than this to its expiry
    pub renewal_window: chrono::Duration,
    /// `iss` claim of issued tokens
    pub issuer: String,
    /// `aud` claim of issued tokens (the identity of the caller)
    pub audience: String,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            lifetime: chrono::Duration::days(8),
            renewal_window: chrono::Duration::days(1),
            issuer: FIELD_MANAGER.to_string(),
            audience: Self::caller_audience("default"),
        }
    }
}

impl TokenPolicy {
    /// `aud` naming the operator instance that watches `namespace`
    pub fn caller_audience(namespace: &str) -> String {
        format!("{}/{}", namespace, FIELD_MANAGER)
    }

    pub fn validate(&self) -> Result<()> {
        if self.renewal_window >= self.lifetime {
            return Err(Error::Configuration(format!(
                "token renewal window ({}h) must be shorter than the token lifetime ({}h)",
                self.renewal_window.num_hours(),
                self.lifetime.num_hours()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Operator Configuration
// =============================================================================

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace whose BlockStorage objects are honoured
    pub namespace: String,
    /// Namespace that receives the CSI workloads and the token secret
    pub workload_namespace: String,
    /// Name of the token secret
    pub token_secret_name: String,
    /// CSI provisioner name
    pub provisioner: String,
    /// Data-plane endpoints advertised to storage classes
    pub endpoints: Endpoints,
    /// Token lifetime policy
    pub token: TokenPolicy,
    /// Delay before the next pass after a completed pass
    pub requeue_interval: Duration,
    /// Delay before the next pass after a validation failure
    pub validation_requeue_interval: Duration,
    /// Upper bound for a single pass
    pub pass_timeout: Duration,
    /// Attempts for a status write that keeps hitting conflicts
    pub status_write_attempts: u32,
    /// Poll interval while waiting for a secret deletion
    pub deletion_poll_interval: Duration,
    /// Upper bound for waiting on a secret deletion
    pub deletion_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            workload_namespace: "kube-system".to_string(),
            token_secret_name: DEFAULT_TOKEN_SECRET.to_string(),
            provisioner: DEFAULT_PROVISIONER.to_string(),
            endpoints: Endpoints::default(),
            token: TokenPolicy::default(),
            requeue_interval: Duration::from_secs(30),
            validation_requeue_interval: Duration::from_secs(10),
            pass_timeout: Duration::from_secs(120),
            status_write_attempts: 3,
            deletion_poll_interval: Duration::from_millis(500),
            deletion_timeout: Duration::from_secs(30),
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.workload_namespace.is_empty() {
            return Err(Error::Configuration("namespaces must not be empty".into()));
        }
        if self.status_write_attempts == 0 {
            return Err(Error::Configuration(
                "status_write_attempts must be at least 1".into(),
            ));
        }
        if self.pass_timeout.is_zero() {
            return Err(Error::Configuration("pass_timeout must be positive".into()));
        }
        self.token.validate()
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// A single `host:port` endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Configuration(format!("endpoint {:?} is missing a port", s)))?;
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Configuration(format!(
                "endpoint {:?} has an empty host",
                s
            )));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| Error::Configuration(format!("endpoint {:?} has invalid port: {}", s, e)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Comma separated endpoint list, e.g. `10.0.0.1:443,10.0.0.2:443`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints(pub Vec<Endpoint>);

impl Endpoints {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.0.iter()
    }
}

impl FromStr for Endpoints {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::parse::<Endpoint>)
            .collect::<Result<Vec<_>>>()
            .map(Endpoints)
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}
