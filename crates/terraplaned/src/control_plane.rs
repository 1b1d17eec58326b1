//! Control plane assembly.
//!
//! Wires the subsystems together and runs them until Ctrl-C:
//! 1. Opens the state store under the data directory
//! 2. Builds vault, deployment service, compiler, executor and job runner
//! 3. Resumes every project with queued jobs
//! 4. Forwards queue wake-ups to per-project workers
//! 5. Serves the REST API, then drains the workers on shutdown

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use terraplane_compiler::ConfigCompiler;
use terraplane_core::{ControlPlaneConfig, SecretVault};
use terraplane_deploy::DeploymentService;
use terraplane_executor::{Executor, StoreLogSink, TerraformExecutor};
use terraplane_queue::{JobRunner, QueueManager, QueuePublisher, RunnerSettings};
use terraplane_state::{StateStore, StoreVault};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Read `terraplane.toml` (or take the defaults) and apply CLI overrides.
pub fn load_config(
    path: Option<&Path>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<ControlPlaneConfig> {
    let mut config = match path {
        Some(path) => ControlPlaneConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("load config {}: {e}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.server.data_dir = data_dir;
    }
    Ok(config)
}

/// The assembled subsystems, before anything is running.
pub struct ControlPlane {
    pub service: DeploymentService,
    pub manager: QueueManager,
    wakeups: mpsc::UnboundedReceiver<String>,
}

impl ControlPlane {
    pub fn assemble(config: &ControlPlaneConfig, store: StateStore, executor: Arc<dyn Executor>) -> Self {
        let vault: Arc<dyn SecretVault> = Arc::new(StoreVault::new(store.clone()));
        let (publisher, wakeups) = QueuePublisher::channel();
        let service = DeploymentService::new(store.clone(), vault.clone(), Arc::new(publisher));
        let compiler = ConfigCompiler::new(store.clone(), vault, config.executor.module_root.clone());
        let runner = JobRunner::new(
            service.clone(),
            compiler,
            executor,
            Arc::new(StoreLogSink::new(store)),
            RunnerSettings::from_config(config),
        );
        Self {
            service,
            manager: QueueManager::new(runner),
            wakeups,
        }
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("Terraplane daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    std::fs::create_dir_all(&config.executor.work_root)?;
    let db_path = config.server.data_dir.join("terraplane.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let executor = TerraformExecutor::new(config.executor.binary.clone(), config.executor.plan_file.clone());
    info!(binary = %config.executor.binary, "executor configured");

    let plane = ControlPlane::assemble(&config, store, Arc::new(executor));

    // ── Queue workers ──────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let resumed = plane.manager.resume().await?;
    info!(projects = resumed, "queue manager started");
    let dispatcher = plane.manager.spawn(plane.wakeups, shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let router = terraplane_api::build_router(plane.service);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_shutdown = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
            let _ = server_shutdown.send(true);
        })
        .await?;

    // Running jobs finish before their workers exit.
    let _ = shutdown_tx.send(true);
    dispatcher.await?;

    info!("Terraplane daemon stopped");
    Ok(())
}
