//! QueueManager — registry of per-project queue workers.
//!
//! At most one worker exists per project, so a project's queue is consumed
//! by a single task and its partition directories are only ever touched by
//! that task. Workers start lazily on the first wake-up and keep running
//! until shutdown; projects run in parallel with each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::QueueResult;
use crate::worker::{JobRunner, run_worker};

/// Per-project worker state.
struct WorkerSlot {
    handle: JoinHandle<()>,
    /// Wakes the worker when new messages were committed.
    wake: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct QueueManager {
    runner: Arc<JobRunner>,
    /// Active workers: project_id → slot.
    workers: Arc<RwLock<HashMap<String, WorkerSlot>>>,
}

impl QueueManager {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Make sure the project has a worker and tell it to look at its queue.
    pub async fn wake(&self, project_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(slot) = workers.get(project_id) {
            if !slot.handle.is_finished() {
                slot.wake.notify_one();
                return;
            }
            warn!(%project_id, "queue worker exited, restarting");
        }

        let wake = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_worker(
            project_id.to_string(),
            self.runner.clone(),
            wake.clone(),
            shutdown_rx,
        ));
        workers.insert(
            project_id.to_string(),
            WorkerSlot {
                handle,
                wake,
                shutdown_tx,
            },
        );
        info!(%project_id, "queue worker started");
    }

    /// Start workers for every project with messages left from a previous
    /// run. Returns the number of projects resumed.
    pub async fn resume(&self) -> QueueResult<usize> {
        let projects = self.runner.store().queued_projects()?;
        for project_id in &projects {
            self.wake(project_id).await;
        }
        if !projects.is_empty() {
            info!(projects = projects.len(), "queued projects resumed");
        }
        Ok(projects.len())
    }

    /// Forward wake-ups from the publisher until shutdown, then stop all
    /// workers.
    pub fn spawn(
        &self,
        mut wakeups: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    project = wakeups.recv() => match project {
                        Some(project_id) => manager.wake(&project_id).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            manager.stop_all().await;
        })
    }

    /// Stop every worker, letting running jobs finish.
    pub async fn stop_all(&self) {
        let slots: Vec<(String, WorkerSlot)> = self.workers.write().await.drain().collect();
        for (_, slot) in &slots {
            let _ = slot.shutdown_tx.send(true);
        }
        for (project_id, slot) in slots {
            if let Err(e) = slot.handle.await {
                warn!(%project_id, error = %e, "queue worker ended abnormally");
            }
            debug!(%project_id, "queue worker stopped");
        }
        info!("all queue workers stopped");
    }

    pub async fn active_workers(&self) -> Vec<String> {
        let workers = self.workers.read().await;
        let mut projects: Vec<String> = workers
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        projects.sort();
        projects
    }
}
