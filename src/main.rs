//! Block Storage Operator
//!
//! Connects to the backend management API, then runs the `BlockStorage`
//! controller next to a health server and a Prometheus metrics server.

use clap::Parser;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockstore_operator::{
    AdminKey, BackendConnector, Endpoint, Endpoints, Error, KubeResourceClient, KubeStateStore,
    OperatorConfig, ReconcileMetrics, Reconciler, RestConfig, RestConnector, Result, TokenPolicy,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Block Storage Operator - backend projects, tokens, QoS policies and CSI storage classes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace whose BlockStorage objects are reconciled
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Namespace for the CSI workloads and the token secret
    #[arg(long, env = "WORKLOAD_NAMESPACE", default_value = "kube-system")]
    workload_namespace: String,

    /// File holding the backend admin token
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: PathBuf,

    /// File holding the PEM encoded admin private key
    #[arg(long, env = "ADMIN_KEY")]
    admin_key: PathBuf,

    /// Data-plane endpoints advertised to storage classes, host:port,...
    #[arg(long, env = "ENDPOINTS")]
    endpoints: String,

    /// Backend management API endpoint, host:port
    #[arg(long, env = "API_ENDPOINT")]
    api_endpoint: String,

    /// CA bundle of the management API
    #[arg(long, env = "API_CA")]
    api_ca: Option<PathBuf>,

    /// Client certificate for the management API
    #[arg(long, env = "API_CERT", requires = "api_key")]
    api_cert: Option<PathBuf>,

    /// Client key for the management API
    #[arg(long, env = "API_KEY", requires = "api_cert")]
    api_key: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Delay between passes in seconds
    #[arg(long, env = "REQUEUE_SECS", default_value = "30")]
    requeue_secs: u64,

    /// Delay after a validation failure in seconds
    #[arg(long, env = "VALIDATION_REQUEUE_SECS", default_value = "10")]
    validation_requeue_secs: u64,

    /// Upper bound for one pass in seconds
    #[arg(long, env = "PASS_TIMEOUT_SECS", default_value = "120")]
    pass_timeout_secs: u64,

    /// Lifetime of issued access tokens in hours
    #[arg(long, env = "TOKEN_LIFETIME_HOURS", default_value = "192")]
    token_lifetime_hours: i64,

    /// Rotate tokens this many hours before they expire
    #[arg(long, env = "TOKEN_RENEWAL_HOURS", default_value = "24")]
    token_renewal_hours: i64,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        let config = OperatorConfig {
            namespace: self.namespace.clone(),
            workload_namespace: self.workload_namespace.clone(),
            endpoints: self.endpoints.parse::<Endpoints>()?,
            token: TokenPolicy {
                lifetime: chrono::Duration::hours(self.token_lifetime_hours),
                renewal_window: chrono::Duration::hours(self.token_renewal_hours),
                audience: TokenPolicy::caller_audience(&self.namespace),
                ..Default::default()
            },
            requeue_interval: Duration::from_secs(self.requeue_secs),
            validation_requeue_interval: Duration::from_secs(self.validation_requeue_secs),
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn rest_config(&self) -> Result<RestConfig> {
        let endpoint: Endpoint = self.api_endpoint.parse()?;
        let token = std::fs::read_to_string(&self.admin_token)?.trim().to_string();
        if token.is_empty() {
            return Err(Error::Configuration(format!(
                "admin token file {} is empty",
                self.admin_token.display()
            )));
        }

        let ca_pem = self.api_ca.as_ref().map(std::fs::read).transpose()?;
        let identity_pem = match (&self.api_cert, &self.api_key) {
            (Some(cert), Some(key)) => {
                let mut pem = std::fs::read(cert)?;
                pem.push(b'\n');
                pem.extend(std::fs::read(key)?);
                Some(pem)
            }
            _ => None,
        };

        Ok(RestConfig {
            endpoint: endpoint.to_string(),
            token,
            ca_pem,
            identity_pem,
            ..Default::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Block Storage Operator");
    info!("  Version: {}", blockstore_operator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Workload namespace: {}", args.workload_namespace);
    info!("  Management API: {}", args.api_endpoint);

    let config = args.operator_config()?;
    let admin_key = Arc::new(AdminKey::from_file(&args.admin_key)?);

    let backend = Arc::new(RestConnector::new(args.rest_config()?)?);
    let backend_info = backend.info().await.map_err(|e| {
        error!(error = %e, "cannot connect to the backend management API");
        e
    })?;
    info!(
        api_version = %backend_info.api_version,
        endpoints = ?backend_info.api_endpoints,
        "connected to backend"
    );

    let client = kube::Client::try_default().await?;
    let metrics = Arc::new(
        ReconcileMetrics::new(Arc::new(prometheus::Registry::new()))
            .map_err(|e| Error::Internal(format!("cannot register metrics: {}", e)))?,
    );

    let reconciler = Arc::new(
        Reconciler::new(
            backend,
            Arc::new(KubeStateStore::new(client.clone())),
            Arc::new(KubeResourceClient::new(client.clone())),
            admin_key,
            config,
        )
        .with_metrics(metrics.clone()),
    );

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = args.health_addr.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, token).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics, token).await {
            error!("Metrics server error: {}", e);
        }
    });

    let result = blockstore_operator::reconciler::controller::run(client, reconciler).await;
    shutdown.cancel();

    info!("Operator shutdown complete");
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("rustls=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled())
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    metrics: Arc<ReconcileMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.export_text() {
                            Ok(text) => {
                                let mut response = Response::new(Body::from(text));
                                if let Ok(value) = prometheus::TEXT_FORMAT.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!(error = %e, "cannot encode metrics");
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled())
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
