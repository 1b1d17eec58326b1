//! Durable per-project job queue.
//!
//! Messages live in the `queue` table under `{project_id}:{seq:020}`, so a
//! prefix scan yields one project's messages in FIFO order. Delivery is
//! at-least-once: a consumer peeks the head, processes it, then acks it.

use tracing::{debug, warn};

use crate::error::StateResult;
use crate::store::{StateStore, StateTxn};
use crate::types::*;

const QUEUE_SEQUENCE: &str = "queue";

impl StateTxn<'_> {
    /// Append a job to a project's queue.
    pub fn enqueue(
        &self,
        job: JobKind,
        project_id: &str,
        deployment_id: Option<&str>,
    ) -> StateResult<QueueMessage> {
        let message = QueueMessage {
            seq: self.next_sequence(QUEUE_SEQUENCE)?,
            job,
            project_id: project_id.to_string(),
            deployment_id: deployment_id.map(str::to_string),
            timestamp: epoch_secs(),
            deliveries: 0,
        };
        self.put(&message)?;
        Ok(message)
    }
}

impl StateStore {
    pub fn enqueue(
        &self,
        job: JobKind,
        project_id: &str,
        deployment_id: Option<&str>,
    ) -> StateResult<QueueMessage> {
        let message = self.write(|txn| txn.enqueue(job, project_id, deployment_id))?;
        debug!(%project_id, seq = message.seq, job = ?job, "message enqueued");
        Ok(message)
    }

    /// Oldest message of a project's queue.
    pub fn peek_queue(&self, project_id: &str) -> StateResult<Option<QueueMessage>> {
        self.first_prefix(&format!("{project_id}:"))
    }

    /// Remove a processed message. Returns false if it was already gone.
    pub fn ack(&self, message: &QueueMessage) -> StateResult<bool> {
        self.delete::<QueueMessage>(&message.row_key())
    }

    /// Record a failed delivery. The message keeps its position until it has
    /// failed `max_deliveries` times, after which it is dropped. Returns
    /// whether the message will be delivered again.
    pub fn requeue(&self, message: &QueueMessage, max_deliveries: u32) -> StateResult<bool> {
        let key = message.row_key();
        let kept = self.write(|txn| -> StateResult<bool> {
            let Some(mut stored) = txn.get::<QueueMessage>(&key)? else {
                return Ok(false);
            };
            stored.deliveries += 1;
            if stored.deliveries >= max_deliveries {
                txn.delete::<QueueMessage>(&key)?;
                return Ok(false);
            }
            txn.put(&stored)?;
            Ok(true)
        })?;
        if !kept {
            warn!(
                project_id = %message.project_id,
                seq = message.seq,
                "message dropped after final delivery"
            );
        }
        Ok(kept)
    }

    pub fn queue_len(&self, project_id: &str) -> StateResult<usize> {
        Ok(self
            .list_prefix::<QueueMessage>(&format!("{project_id}:"))?
            .len())
    }

    /// Projects with at least one queued message, for startup recovery.
    pub fn queued_projects(&self) -> StateResult<Vec<ProjectId>> {
        let mut projects: Vec<ProjectId> = self
            .list::<QueueMessage>()?
            .into_iter()
            .map(|m| m.project_id)
            .collect();
        projects.dedup();
        Ok(projects)
    }
}
