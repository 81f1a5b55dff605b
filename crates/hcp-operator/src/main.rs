//! HCP Operator - drives Operation records to a terminal state

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use hcp_common::crd::Operation;
use hcp_common::events::KubeEventPublisher;
use hcp_common::telemetry::{init_telemetry, TelemetryConfig};
use hcp_common::{CONTROLLER_NAME, DEFAULT_OPERATIONS_NAMESPACE};
use hcp_operator::provider::{HttpStatusProvider, ProbeStatus, StaticStatusProvider, StatusProvider};
use hcp_operator::store::{KubeOperationCache, KubeOperationStore};
use hcp_operator::{shutdown, Context, Controller, ControllerConfig};
use hcp_workqueue::RateLimiterConfig;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProviderKind {
    /// Every probe reports success
    Static,
    /// Ask the backend over HTTP
    Http,
}

/// HCP operator - reconciles Operation custom resources
#[derive(Parser, Debug)]
#[command(name = "hcp-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Operation CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; empty watches all namespaces
    #[arg(long, env = "HCP_NAMESPACE", default_value = DEFAULT_OPERATIONS_NAMESPACE)]
    namespace: String,

    /// Number of parallel workers
    #[arg(long, env = "HCP_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Seconds between full resyncs; 0 disables
    #[arg(long, env = "HCP_RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// First retry delay in milliseconds
    #[arg(long, env = "HCP_RETRY_BASE_DELAY_MS", default_value_t = 5)]
    retry_base_delay_ms: u64,

    /// Retry delay ceiling in seconds
    #[arg(long, env = "HCP_RETRY_MAX_DELAY_SECS", default_value_t = 1000)]
    retry_max_delay_secs: u64,

    /// Global retry rate
    #[arg(long, env = "HCP_RETRY_QPS", default_value_t = 50)]
    retry_qps: u32,

    /// Global retry burst
    #[arg(long, env = "HCP_RETRY_BURST", default_value_t = 300)]
    retry_burst: u32,

    /// Status provider implementation
    #[arg(long, env = "HCP_PROVIDER", value_enum, default_value_t = ProviderKind::Http)]
    provider: ProviderKind,

    /// Base URL of the status backend (http provider)
    #[arg(long, env = "HCP_PROVIDER_URL", required_if_eq("provider", "http"))]
    provider_url: Option<String>,

    /// Per-probe timeout in seconds
    #[arg(long, env = "HCP_PROVIDER_TIMEOUT_SECS", default_value_t = 10)]
    provider_timeout_secs: u64,

    /// Skip installing the CRD on startup
    #[arg(long, env = "HCP_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "HCP_TEXT_LOGS")]
    text_logs: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            rate_limiter: RateLimiterConfig {
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_secs(self.retry_max_delay_secs),
                qps: self.retry_qps,
                burst: self.retry_burst,
            },
            resync_interval: (self.resync_interval_secs > 0)
                .then(|| Duration::from_secs(self.resync_interval_secs)),
        }
    }

    fn status_provider(&self) -> anyhow::Result<Arc<dyn StatusProvider>> {
        Ok(match self.provider {
            ProviderKind::Static => Arc::new(StaticStatusProvider::new(ProbeStatus::succeeded())),
            ProviderKind::Http => {
                let url = self
                    .provider_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--provider-url is required for the http provider"))?;
                Arc::new(HttpStatusProvider::new(
                    url,
                    Duration::from_secs(self.provider_timeout_secs),
                )?)
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Operation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let mut telemetry = TelemetryConfig::for_service("hcp-operator");
    telemetry.json_logs = !cli.text_logs;
    init_telemetry(telemetry)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !cli.skip_crd_install {
        ensure_crd_installed(&client).await?;
    }

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone())?;

    let cache = KubeOperationCache::spawn(client.clone(), &cli.namespace, cancel.clone());
    let ctx = Context::new(
        Arc::new(KubeOperationStore::new(client.clone())),
        Arc::new(cache),
        cli.status_provider()?,
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
    );

    info!(
        namespace = %cli.namespace,
        workers = cli.workers,
        provider = ?cli.provider,
        "Starting operation controller"
    );
    Controller::new(ctx, cli.controller_config())
        .run(cancel)
        .await?;
    Ok(())
}

/// Install or update the Operation CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    info!("Installing Operation CRD");
    crds.patch(
        "operations.arohcp.openshift.io",
        &params,
        &Patch::Apply(&Operation::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Operation CRD: {}", e))?;
    Ok(())
}
