//! HCP Frontend - ARM resource-provider frontend

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hcp_common::events::NoopEventPublisher;
use hcp_common::telemetry::{init_telemetry, TelemetryConfig};
use hcp_common::DEFAULT_OPERATIONS_NAMESPACE;
use hcp_frontend::middleware::MAX_BODY_BYTES;
use hcp_frontend::{serve, AppState, ServerConfig};
use hcp_operator::provider::{ProbeStatus, StaticStatusProvider};
use hcp_operator::store::{KubeOperationStore, MemoryStore, OperationStore};
use hcp_operator::{shutdown, Context, Controller, ControllerConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Operation custom resources on the current cluster
    Kubernetes,
    /// In-process store with an embedded controller; for local development
    Memory,
}

/// HCP frontend - admits ARM writes as Operation records
#[derive(Parser, Debug)]
#[command(name = "hcp-frontend", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "HCP_FRONTEND_ADDR", default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// Namespace Operations are created in
    #[arg(long, env = "HCP_NAMESPACE", default_value = DEFAULT_OPERATIONS_NAMESPACE)]
    namespace: String,

    /// Where Operations are stored
    #[arg(long, env = "HCP_BACKEND", value_enum, default_value_t = Backend::Kubernetes)]
    backend: Backend,

    /// Largest accepted request body in bytes
    #[arg(long, env = "HCP_MAX_BODY_BYTES", default_value_t = MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Workers for the embedded controller (memory backend)
    #[arg(long, env = "HCP_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "HCP_TEXT_LOGS")]
    text_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::for_service("hcp-frontend");
    telemetry.json_logs = !cli.text_logs;
    init_telemetry(telemetry)?;

    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone())?;

    let mut controller = None;
    let store: Arc<dyn OperationStore> = match cli.backend {
        Backend::Kubernetes => {
            let client = Client::try_default()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
            Arc::new(KubeOperationStore::new(client))
        }
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let ctx = Context::new(
                store.clone(),
                store.clone(),
                Arc::new(StaticStatusProvider::new(ProbeStatus::succeeded())),
                Arc::new(NoopEventPublisher),
            );
            let config = ControllerConfig {
                workers: cli.workers,
                ..Default::default()
            };
            info!(workers = cli.workers, "Starting embedded operation controller");
            controller = Some(tokio::spawn(
                Controller::new(ctx, config).run(cancel.clone()),
            ));
            store
        }
    };

    let state = AppState {
        store,
        namespace: cli.namespace.clone(),
    };
    let config = ServerConfig {
        addr: cli.listen,
        max_body_bytes: cli.max_body_bytes,
    };
    info!(backend = ?cli.backend, namespace = %cli.namespace, "Starting frontend");

    let served = serve(config, state, cancel.clone()).await;
    cancel.cancel();
    if let Some(controller) = controller {
        controller.await??;
    }
    served?;
    Ok(())
}
