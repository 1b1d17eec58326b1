//! Job execution for one queue message, and the per-project worker loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use terraplane_compiler::ConfigCompiler;
use terraplane_core::{ControlPlaneConfig, DeploymentType};
use terraplane_deploy::{DeployError, DeploymentService};
use terraplane_executor::{Executor, LogBuffer, LogSession, LogSink, Run};
use terraplane_state::{Deployment, DeploymentStatus, JobKind, QueueMessage, StateStore, refresh_scope};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};

/// Runner settings taken from the daemon configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Partition directories live at `<work_root>/<project>/<partition>`.
    pub work_root: PathBuf,
    pub flush_interval: Duration,
    /// Deliveries before a failing message is dropped.
    pub max_deliveries: u32,
}

impl RunnerSettings {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            work_root: config.executor.work_root.clone(),
            flush_interval: config.log_flush_interval(),
            max_deliveries: config.queue.max_deliveries.max(1),
        }
    }
}

/// Executes queue messages: compile the partition, drive the executor,
/// hand the result to the deployment service.
pub struct JobRunner {
    service: DeploymentService,
    compiler: ConfigCompiler,
    executor: Arc<dyn Executor>,
    sink: Arc<dyn LogSink>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        service: DeploymentService,
        compiler: ConfigCompiler,
        executor: Arc<dyn Executor>,
        sink: Arc<dyn LogSink>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            service,
            compiler,
            executor,
            sink,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        self.service.store()
    }

    pub fn partition_dir(&self, project_id: &str, deployment_type: DeploymentType) -> PathBuf {
        self.settings
            .work_root
            .join(project_id)
            .join(deployment_type.partition_name())
    }

    /// Process one message to completion: ack on success; on failure mark
    /// the deployment failed, compensate, and requeue the message.
    pub async fn handle(&self, message: &QueueMessage) {
        let outcome = match message.job {
            JobKind::Refresh => self.refresh(&message.project_id).await,
            JobKind::Plan | JobKind::Apply => self.execute(message).await,
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store().ack(message) {
                    error!(project_id = %message.project_id, seq = message.seq, error = %e, "ack failed");
                }
            }
            Err(e) => {
                error!(
                    project_id = %message.project_id,
                    deployment_id = ?message.deployment_id,
                    job = ?message.job,
                    error = %e,
                    "job failed"
                );
                if let Some(deployment_id) = &message.deployment_id {
                    self.compensate(deployment_id, &DeployError::from(e)).await;
                }
                if let Err(e) = self.store().requeue(message, self.settings.max_deliveries) {
                    error!(project_id = %message.project_id, seq = message.seq, error = %e, "requeue failed");
                }
            }
        }
    }

    async fn execute(&self, message: &QueueMessage) -> QueueResult<()> {
        let Some(deployment_id) = message.deployment_id.as_deref() else {
            warn!(project_id = %message.project_id, seq = message.seq, "job without a deployment, dropped");
            return Ok(());
        };
        let Some(deployment) = self.service.begin_execution(deployment_id, message.job)? else {
            return self.skip(deployment_id, message);
        };

        let session = LogSession::start(
            self.sink.clone(),
            deployment.id.clone(),
            self.settings.flush_interval,
        );
        let log = session.buffer();
        log.system(format!("{:?} started for {}", message.job, deployment.name));
        let result = self.run_job(&deployment, message.job, log.clone()).await;
        match &result {
            Ok(()) => log.system(format!("{:?} finished", message.job)),
            Err(e) => log.system(format!("{:?} failed: {e}", message.job)),
        }
        session.finish().await;
        result
    }

    /// A message whose deployment is not queued was either handled already
    /// (redelivery after a failure) or cut short by a restart.
    fn skip(&self, deployment_id: &str, message: &QueueMessage) -> QueueResult<()> {
        let Some(current) = self.store().get_deployment(deployment_id)? else {
            warn!(%deployment_id, seq = message.seq, "deployment is gone, message dropped");
            return Ok(());
        };
        if matches!(current.status, DeploymentStatus::Planning | DeploymentStatus::Running) {
            return Err(QueueError::Interrupted(deployment_id.to_string()));
        }
        warn!(
            %deployment_id,
            status = %current.status,
            seq = message.seq,
            "deployment is not queued, message skipped"
        );
        Ok(())
    }

    async fn run_job(&self, deployment: &Deployment, job: JobKind, log: LogBuffer) -> QueueResult<()> {
        let run = self.prepare(&deployment.project_id, deployment.deployment_type, log)?;
        self.executor.init(&run).await?;
        self.executor.validate(&run).await?;
        match job {
            JobKind::Plan => {
                let plan = self.executor.plan(&run).await?;
                self.service.complete_plan(&deployment.id, plan)?;
            }
            JobKind::Apply | JobKind::Refresh => {
                self.executor.apply(&run).await?;
                let outputs = self.executor.output(&run).await?;
                self.service.complete_apply(&deployment.id, &outputs)?;
            }
        }
        Ok(())
    }

    /// Compile the partition into its directory and build the run context.
    fn prepare(&self, project_id: &str, deployment_type: DeploymentType, log: LogBuffer) -> QueueResult<Run> {
        let artifacts = self.compiler.compile(project_id, deployment_type)?;
        let dir = self.partition_dir(project_id, deployment_type);
        artifacts.write_to(&dir)?;
        debug!(%project_id, dir = %dir.display(), units = artifacts.units.len(), "partition prepared");
        Ok(Run {
            dir,
            env: artifacts.secret_env,
            log,
        })
    }

    /// Mark the deployment failed and, when the failed run may have left
    /// infrastructure behind, apply the partition without it. Compensation
    /// failures are logged only.
    async fn compensate(&self, deployment_id: &str, error: &DeployError) {
        let outcome = match self.service.fail_deployment(deployment_id, &error.to_string()) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) => {
                error!(%deployment_id, error = %e, "could not mark deployment failed");
                return;
            }
        };
        if !outcome.teardown {
            return;
        }
        let deployment = outcome.deployment;
        let session = LogSession::start(
            self.sink.clone(),
            deployment.id.clone(),
            self.settings.flush_interval,
        );
        let log = session.buffer();
        log.system("tearing down partially applied changes");
        let result = self.teardown(&deployment, log.clone()).await;
        if let Err(e) = &result {
            log.system(format!("teardown failed: {e}"));
        }
        session.finish().await;
        match result {
            Ok(()) => info!(%deployment_id, "partial apply torn down"),
            Err(e) => warn!(%deployment_id, error = %e, "teardown after failure did not complete"),
        }
    }

    async fn teardown(&self, deployment: &Deployment, log: LogBuffer) -> QueueResult<()> {
        let run = self.prepare(&deployment.project_id, deployment.deployment_type, log)?;
        self.executor.init(&run).await?;
        self.executor.apply(&run).await?;
        Ok(())
    }

    /// Re-read outputs of every partition, in apply order, into resource
    /// details.
    async fn refresh(&self, project_id: &str) -> QueueResult<()> {
        let session = LogSession::start(
            self.sink.clone(),
            refresh_scope(project_id),
            self.settings.flush_interval,
        );
        let log = session.buffer();
        let result = self.refresh_partitions(project_id, &log).await;
        if let Err(e) = &result {
            log.system(format!("refresh failed: {e}"));
        }
        session.finish().await;
        result
    }

    async fn refresh_partitions(&self, project_id: &str, log: &LogBuffer) -> QueueResult<()> {
        let mut updated = 0;
        for deployment_type in DeploymentType::APPLY_ORDER {
            let artifacts = self.compiler.compile(project_id, deployment_type)?;
            if artifacts.is_empty() {
                continue;
            }
            let dir = self.partition_dir(project_id, deployment_type);
            artifacts.write_to(&dir)?;
            log.system(format!("refreshing {}", deployment_type.partition_name()));
            let run = Run {
                dir,
                env: artifacts.secret_env,
                log: log.clone(),
            };
            self.executor.init(&run).await?;
            self.executor.refresh(&run).await?;
            let outputs = self.executor.output(&run).await?;
            updated += self.service.refresh_resource_details(project_id, &outputs)?;
        }
        info!(%project_id, updated, "project refreshed");
        Ok(())
    }
}

/// The single consumer of one project's queue. Drains the queue, then
/// sleeps until woken or told to stop. Shutdown is honoured between jobs;
/// a running job is never cut short.
pub(crate) async fn run_worker(
    project_id: String,
    runner: Arc<JobRunner>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%project_id, "queue worker starting");
    loop {
        loop {
            if *shutdown.borrow() {
                debug!(%project_id, "queue worker stopping");
                return;
            }
            match runner.store().peek_queue(&project_id) {
                Ok(Some(message)) => runner.handle(&message).await,
                Ok(None) => break,
                Err(e) => {
                    error!(%project_id, error = %e, "queue read failed");
                    break;
                }
            }
        }

        tokio::select! {
            _ = wake.notified() => {}
            _ = shutdown.changed() => {
                debug!(%project_id, "queue worker stopping");
                return;
            }
        }
    }
}
