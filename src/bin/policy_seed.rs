//! Policy seed
//!
//! Converges the backend's global QoS policies to a YAML list once and exits.
//! Non-zero exit status when any policy could not be converged.
//!
//! ```yaml
//! - name: floppy-policy
//!   description: Unbearably slow
//!   limit:
//!     bandwidth: { read: 15, write: 15 }
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

use blockstore_operator::{
    BackendConnector, Endpoint, MemoryBackend, PolicyEnsurer, QoSPolicySpec, RestConfig,
    RestConnector,
};

/// Overall deadline for one run
const SEED_TIMEOUT: Duration = Duration::from_secs(120);

/// Seed global QoS policies on the block-storage backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with the list of policies
    #[arg(long, env = "POLICIES")]
    policies: PathBuf,

    /// Backend management API endpoint, host:port
    #[arg(long, env = "API_ENDPOINT", required_unless_present = "dry_run")]
    api_endpoint: Option<String>,

    /// File holding the backend admin token
    #[arg(long, env = "ADMIN_TOKEN", default_value = "/blockstore/admin-token")]
    admin_token: PathBuf,

    /// CA bundle of the management API
    #[arg(long, env = "API_CA")]
    api_ca: Option<PathBuf>,

    /// Client certificate for the management API
    #[arg(long, env = "API_CERT", requires = "api_key")]
    api_cert: Option<PathBuf>,

    /// Client key for the management API
    #[arg(long, env = "API_KEY", requires = "api_cert")]
    api_key: Option<PathBuf>,

    /// Run against an empty in-memory backend and log the calls it would make
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .json()
        .with_max_level(level)
        .init();

    let policies = read_policies(&args.policies)?;
    info!(count = policies.len(), file = %args.policies.display(), "loaded policies");

    let dry_run = args.dry_run.then(|| Arc::new(MemoryBackend::new()));
    let backend: Arc<dyn BackendConnector> = match &dry_run {
        Some(memory) => memory.clone(),
        None => Arc::new(connect(&args)?),
    };

    let (report, result) = tokio::time::timeout(
        SEED_TIMEOUT,
        PolicyEnsurer::new(backend.as_ref()).ensure_policies(&policies),
    )
    .await
    .context("seeding policies timed out")?;

    info!(
        created = ?report.created,
        updated = ?report.updated,
        deleted = ?report.deleted,
        unchanged = ?report.unchanged,
        backend = backend.backend_name(),
        "policies seeded"
    );
    if let Some(memory) = &dry_run {
        log_dry_run(memory);
    }
    result.context("failed to ensure qos policies")?;
    Ok(())
}

/// Log the calls a real run would have sent, returns how many
fn log_dry_run(memory: &MemoryBackend) -> usize {
    let calls = memory.mutations();
    for call in &calls {
        info!(?call, "dry run");
    }
    calls.len()
}

fn read_policies(path: &Path) -> Result<Vec<QoSPolicySpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read policies from {}", path.display()))?;
    let policies: Vec<QoSPolicySpec> = serde_yaml::from_str(&raw)
        .with_context(|| format!("unable to parse policies in {}", path.display()))?;

    let mut seen = HashSet::new();
    if let Some(duplicate) = policies.iter().find(|p| !seen.insert(p.name.as_str())) {
        bail!("qos policy {:?} is declared more than once", duplicate.name);
    }
    Ok(policies)
}

fn connect(args: &Args) -> Result<RestConnector> {
    let Some(endpoint) = &args.api_endpoint else {
        bail!("--api-endpoint is required");
    };
    let endpoint: Endpoint = endpoint.parse().context("unable to parse api-endpoint")?;

    let token = std::fs::read_to_string(&args.admin_token)
        .context("unable to read admin-token from file")?
        .trim()
        .to_string();

    let ca_pem = args
        .api_ca
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .context("unable to read api-ca from file")?;
    let identity_pem = match (&args.api_cert, &args.api_key) {
        (Some(cert), Some(key)) => {
            let mut pem = std::fs::read(cert).context("unable to read api-cert from file")?;
            pem.push(b'\n');
            pem.extend(std::fs::read(key).context("unable to read api-key from file")?);
            Some(pem)
        }
        _ => None,
    };

    let connector = RestConnector::new(RestConfig {
        endpoint: endpoint.to_string(),
        token,
        ca_pem,
        identity_pem,
        ..Default::default()
    })
    .context("cannot connect to backend api")?;
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_policies() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- name: floppy-policy\n  description: Unbearably slow\n  limit:\n    bandwidth: {{ read: 15, write: 15 }}\n- name: per-gb\n  limit:\n    iopsPerGb: {{ read: 3, write: 3 }}"
        )
        .unwrap();

        let policies = read_policies(file.path()).unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].name, "floppy-policy");
        assert!(policies[0].limit.bandwidth.is_some());
        assert!(policies[1].limit.iops_per_gb.is_some());
        assert!(policies[1].description.is_empty());
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "- name: a\n  limit:\n    iops: {{ read: 100, write: 100 }}\n- name: a\n  limit:\n    iops: {{ read: 200, write: 200 }}"
        )
        .unwrap();

        let err = read_policies(file.path()).unwrap_err();
        assert!(err.to_string().contains("\"a\" is declared more than once"));
    }

    #[tokio::test]
    async fn test_dry_run_logs_every_call() {
        let memory = MemoryBackend::new();
        let policies: Vec<QoSPolicySpec> = serde_yaml::from_str(
            "- name: floppy-policy\n  limit:\n    bandwidth: { read: 15, write: 15 }\n- name: per-gb\n  limit:\n    iopsPerGb: { read: 3, write: 3 }",
        )
        .unwrap();

        let (report, result) = PolicyEnsurer::new(&memory).ensure_policies(&policies).await;
        result.unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(log_dry_run(&memory), 2);

        // Converged: a second run would send nothing new
        memory.clear_calls();
        let (_, result) = PolicyEnsurer::new(&memory).ensure_policies(&policies).await;
        result.unwrap();
        assert_eq!(log_dry_run(&memory), 0);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = read_policies(Path::new("/nonexistent/policies.yaml")).unwrap_err();
        assert!(err.to_string().contains("unable to read policies"));
    }
}
