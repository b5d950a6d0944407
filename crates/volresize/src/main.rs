mod duration;
mod server;

use clap::{ArgAction, Parser, ValueEnum};
use duration::parse_duration;
use futures_util::FutureExt;
use prometheus::Registry;
use server::DiagnosticsServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use volresize_controller::{
    ControllerConfig, InUsePolicy, LeaderGate, LeaseConfig, LeaseElector, RateLimiterConfig,
    ResizeController, ResizerMetrics, RunFn, Standalone,
};
use volresize_driver::{DriverClient, HttpDriverClient, MockDriver, Resizer};
use volresize_store::{ApiConfig, HttpStore};

/// API server used when neither a kubeconfig nor a cluster environment is found
const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Driver name reported by `--mock-driver`
const MOCK_DRIVER_NAME: &str = "mock.csi.volresize.io";

/// Grace period for in-flight passes after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "volresize",
    version,
    about = "Volume resize controller: expands bound volumes when their claims ask for more"
)]
struct Cli {
    /// Base URL of the cluster API server; overrides the kubeconfig's server
    #[arg(long, env = "VOLRESIZE_API_URL")]
    api_url: Option<String>,

    /// Kubeconfig to connect with (default: in-cluster service account, if any)
    #[arg(long, env = "VOLRESIZE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Sustained requests per second to the API server; 0 disables the limit
    #[arg(long, env = "VOLRESIZE_KUBE_API_QPS", default_value_t = volresize_store::config::DEFAULT_QPS)]
    kube_api_qps: f32,

    /// Requests allowed in a burst above --kube-api-qps
    #[arg(long, env = "VOLRESIZE_KUBE_API_BURST", default_value_t = volresize_store::config::DEFAULT_BURST)]
    kube_api_burst: u32,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "VOLRESIZE_WORKERS", default_value_t = 10)]
    workers: usize,

    /// Interval between full re-lists of every claim
    #[arg(long, env = "VOLRESIZE_RESYNC_PERIOD", default_value = "600s", value_parser = parse_duration)]
    resync_period: Duration,

    /// Address of the storage driver endpoint (host:port or http URL)
    #[arg(long, env = "VOLRESIZE_DRIVER_ADDRESS", required_unless_present = "mock_driver")]
    driver_address: Option<String>,

    /// Timeout for each call to the driver
    #[arg(long, env = "VOLRESIZE_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    timeout: Duration,

    /// Retry delay after the first failure of a claim
    #[arg(long, env = "VOLRESIZE_RETRY_INTERVAL_START", default_value = "1s", value_parser = parse_duration)]
    retry_interval_start: Duration,

    /// Upper bound for the retry delay of a claim
    #[arg(long, env = "VOLRESIZE_RETRY_INTERVAL_MAX", default_value = "300s", value_parser = parse_duration)]
    retry_interval_max: Duration,

    /// Report "volume in use" driver failures as their own category
    #[arg(
        long,
        env = "VOLRESIZE_HANDLE_VOLUME_INUSE_ERROR",
        default_value_t = true,
        action = ArgAction::Set
    )]
    handle_volume_inuse_error: bool,

    /// Only run while holding the leader lease
    #[arg(long, env = "VOLRESIZE_LEADER_ELECTION")]
    leader_election: bool,

    /// Namespace of the leader lease object
    #[arg(long, env = "VOLRESIZE_LEADER_ELECTION_NAMESPACE", default_value = "default")]
    leader_election_namespace: String,

    /// Identity written into the lease (default: hostname plus a random suffix)
    #[arg(long, env = "VOLRESIZE_LEADER_ELECTION_IDENTITY")]
    leader_election_identity: Option<String>,

    /// Address for health and metrics endpoints; disabled when empty
    #[arg(long, env = "VOLRESIZE_HTTP_ENDPOINT", default_value = "")]
    http_endpoint: String,

    /// Path serving Prometheus metrics
    #[arg(long, env = "VOLRESIZE_METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Log output format
    #[arg(long, env = "VOLRESIZE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Use the in-process mock driver instead of a real driver (development only)
    #[arg(long, env = "VOLRESIZE_MOCK_DRIVER")]
    mock_driver: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            resync_period: self.resync_period,
            rate_limiter: RateLimiterConfig {
                base_delay: self.retry_interval_start,
                max_delay: self.retry_interval_max,
            },
            in_use_policy: InUsePolicy::from_flag(self.handle_volume_inuse_error),
        }
    }

    /// Kubeconfig first, then an explicit URL, then the in-cluster service
    /// account, then the local default
    fn api_config(&self, in_cluster: bool) -> volresize_store::Result<ApiConfig> {
        let mut config = match (&self.kubeconfig, &self.api_url) {
            (Some(path), _) => ApiConfig::from_kubeconfig(path, None)?,
            (None, Some(url)) => ApiConfig::new(url),
            (None, None) if in_cluster => ApiConfig::in_cluster()?,
            (None, None) => ApiConfig::new(DEFAULT_API_URL),
        };
        if let (Some(_), Some(url)) = (&self.kubeconfig, &self.api_url) {
            config.server = url.clone();
        }
        Ok(config.with_rate_limit(self.kube_api_qps, self.kube_api_burst))
    }

    fn lease_identity(&self) -> String {
        match &self.leader_election_identity {
            Some(identity) if !identity.is_empty() => identity.clone(),
            _ => {
                let host = sys_info::hostname().unwrap_or_else(|_| "unknown".to_string());
                format!("{}_{}", host, uuid::Uuid::new_v4())
            }
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    run(cli).await
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(cli: Cli) -> miette::Result<()> {
    info!("Starting volresize {}", env!("CARGO_PKG_VERSION"));

    if !cli.metrics_path.starts_with('/') {
        return Err(miette::miette!(
            "Invalid metrics path '{}': must start with '/'",
            cli.metrics_path
        ));
    }

    let in_cluster = std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
    let store = Arc::new(
        HttpStore::new(cli.api_config(in_cluster)?)?
            .with_lease_namespace(cli.leader_election_namespace.clone()),
    );
    info!(
        "Using cluster API at {} ({} qps, burst {})",
        store.base_url(),
        cli.kube_api_qps,
        cli.kube_api_burst
    );

    let resizer = Arc::new(create_resizer(&cli).await?);
    info!(
        "Driver {} supports controller expansion: {}, online expansion: {}",
        resizer.name(),
        resizer.supports_controller_expansion(),
        resizer.can_support_online_expansion()
    );

    let registry = Registry::new();
    let metrics = ResizerMetrics::new(&registry)?;

    let gate: Arc<dyn LeaderGate> = if cli.leader_election {
        let identity = cli.lease_identity();
        let lock_name = resizer.lock_name();
        info!(
            "Leader election enabled: lease {}/{} as {}",
            cli.leader_election_namespace, lock_name, identity
        );
        Arc::new(LeaseElector::new(
            store.clone(),
            LeaseConfig::new(lock_name, identity),
        ))
    } else {
        Arc::new(Standalone)
    };

    let controller = Arc::new(ResizeController::new(
        store.clone(),
        resizer.clone(),
        metrics,
        cli.controller_config(),
    )?);

    let token = CancellationToken::new();

    let watch_handle = {
        let store = store.clone();
        let watch_token = token.clone();
        tokio::spawn(async move { store.run_watches(watch_token).await })
    };

    // Diagnostics server
    let server_handle = if cli.http_endpoint.is_empty() {
        None
    } else {
        let listen_addr: std::net::SocketAddr = cli.http_endpoint.parse().map_err(|e| {
            miette::miette!("Invalid http endpoint '{}': {}", cli.http_endpoint, e)
        })?;
        let server = DiagnosticsServer::new(
            server::Config {
                listen_addr,
                metrics_path: cli.metrics_path.clone(),
            },
            registry,
            gate.clone(),
        );
        let listener = server
            .bind()
            .await
            .map_err(|e| miette::miette!("Failed to bind {}: {}", cli.http_endpoint, e))?;
        let server_token = token.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, server_token).await {
                error!("Diagnostics server error: {}", e);
            }
        }))
    };

    // Controller under the leader gate
    let task: RunFn = {
        let controller = controller.clone();
        Box::new(move |run_token: CancellationToken| {
            async move {
                if let Err(e) = controller.run(run_token).await {
                    error!("Resize controller error: {}", e);
                }
            }
            .boxed()
        })
    };
    let mut gate_handle = {
        let gate = gate.clone();
        let gate_token = token.clone();
        tokio::spawn(async move { gate.run(gate_token, task).await })
    };

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;
            info!("Shutting down gracefully...");
            token.cancel();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut gate_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("In-flight work did not finish within {:?}", SHUTDOWN_TIMEOUT);
                    gate_handle.abort();
                    Ok(Ok(()))
                }
            }
        }
        joined = &mut gate_handle => {
            token.cancel();
            joined
        }
    };

    if let Some(handle) = server_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), watch_handle).await;

    result.map_err(|e| miette::miette!("Controller task failed: {}", e))??;
    info!("Shutdown complete");
    Ok(())
}

/// Build the resizer from the configured driver; failure here is fatal
async fn create_resizer(cli: &Cli) -> miette::Result<Resizer> {
    let client: Arc<dyn DriverClient> = match (&cli.driver_address, cli.mock_driver) {
        (_, true) => {
            warn!("Using the in-process mock driver; no real volumes will be expanded");
            Arc::new(MockDriver::new(MOCK_DRIVER_NAME))
        }
        (Some(address), false) => {
            let client = HttpDriverClient::new(address, cli.timeout).map_err(|e| {
                miette::miette!("Invalid driver address '{}': {}", address, e)
            })?;
            info!("Using driver at {}", client.base_url());
            Arc::new(client)
        }
        (None, false) => {
            return Err(miette::miette!(
                "--driver-address is required unless --mock-driver is set"
            ))
        }
    };

    Resizer::from_client(client, cli.timeout)
        .await
        .map_err(|e| miette::miette!("Failed to set up driver: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use volresize_store::Credentials;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["volresize", "--driver-address", "127.0.0.1:9808"]).unwrap();
        assert_eq!(cli.workers, 10);
        assert_eq!(cli.resync_period, Duration::from_secs(600));
        assert_eq!(cli.timeout, Duration::from_secs(10));
        assert!(cli.handle_volume_inuse_error);
        assert!(!cli.leader_election);
        assert!(cli.http_endpoint.is_empty());
        assert_eq!(cli.metrics_path, "/metrics");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(cli.kube_api_qps, 5.0);
        assert_eq!(cli.kube_api_burst, 10);

        let api = cli.api_config(false).unwrap();
        assert_eq!(api.server, DEFAULT_API_URL);
        assert_eq!(api.credentials, Credentials::Anonymous);

        let config = cli.controller_config();
        assert_eq!(config.rate_limiter.base_delay, Duration::from_secs(1));
        assert_eq!(config.rate_limiter.max_delay, Duration::from_secs(300));
        assert_eq!(config.in_use_policy, InUsePolicy::Handle);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "volresize",
            "--mock-driver",
            "--workers",
            "3",
            "--retry-interval-start",
            "250ms",
            "--retry-interval-max",
            "5m",
            "--handle-volume-inuse-error",
            "false",
            "--leader-election",
            "--leader-election-identity",
            "node-a",
            "--log-format",
            "json",
        ])
        .unwrap();

        let config = cli.controller_config();
        assert_eq!(config.workers, 3);
        assert_eq!(config.rate_limiter.base_delay, Duration::from_millis(250));
        assert_eq!(config.rate_limiter.max_delay, Duration::from_secs(300));
        assert_eq!(config.in_use_policy, InUsePolicy::Ignore);
        assert!(cli.leader_election);
        assert_eq!(cli.lease_identity(), "node-a");
        assert_eq!(cli.log_format, LogFormat::Json);
    }

    #[test]
    fn test_api_connection_flags() {
        let cli = Cli::try_parse_from([
            "volresize",
            "--mock-driver",
            "--api-url",
            "https://10.0.0.1:6443",
            "--kube-api-qps",
            "20",
            "--kube-api-burst",
            "40",
        ])
        .unwrap();
        // An explicit URL wins over the cluster environment
        let api = cli.api_config(true).unwrap();
        assert_eq!(api.server, "https://10.0.0.1:6443");
        assert_eq!(api.qps, 20.0);
        assert_eq!(api.burst, 40);

        let dir = tempfile::tempdir().unwrap();
        let kubeconfig = dir.path().join("config");
        std::fs::write(
            &kubeconfig,
            "current-context: lab\n\
             clusters: [{name: lab, cluster: {server: 'https://lab:6443'}}]\n\
             contexts: [{name: lab, context: {cluster: lab, user: ci}}]\n\
             users: [{name: ci, user: {token: t0k3n}}]\n",
        )
        .unwrap();
        let path = kubeconfig.to_str().unwrap();

        let cli = Cli::try_parse_from(["volresize", "--mock-driver", "--kubeconfig", path]).unwrap();
        let api = cli.api_config(true).unwrap();
        assert_eq!(api.server, "https://lab:6443");
        assert_eq!(api.credentials, Credentials::Token("t0k3n".to_string()));

        let cli = Cli::try_parse_from([
            "volresize",
            "--mock-driver",
            "--kubeconfig",
            path,
            "--api-url",
            "http://127.0.0.1:8001",
        ])
        .unwrap();
        let api = cli.api_config(false).unwrap();
        assert_eq!(api.server, "http://127.0.0.1:8001");
        assert_eq!(api.credentials, Credentials::Token("t0k3n".to_string()));

        let cli = Cli::try_parse_from(["volresize", "--mock-driver", "--kubeconfig", "/nonexistent"])
            .unwrap();
        assert!(cli.api_config(false).is_err());
    }

    #[test]
    fn test_driver_address_required_without_mock() {
        assert!(Cli::try_parse_from(["volresize"]).is_err());
        assert!(Cli::try_parse_from(["volresize", "--mock-driver"]).is_ok());
    }

    #[test]
    fn test_generated_identity_is_unique() {
        let cli = Cli::try_parse_from(["volresize", "--mock-driver"]).unwrap();
        assert_ne!(cli.lease_identity(), cli.lease_identity());
    }

    #[tokio::test]
    async fn test_mock_driver_resizer() {
        let cli = Cli::try_parse_from(["volresize", "--mock-driver"]).unwrap();
        let resizer = create_resizer(&cli).await.unwrap();
        assert_eq!(resizer.name(), MOCK_DRIVER_NAME);
        assert!(resizer.supports_controller_expansion());
        assert_eq!(resizer.lock_name(), "external-resizer-mock-csi-volresize-io");
    }
}
