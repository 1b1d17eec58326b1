//! Bridge from committed queue messages to the queue manager.

use terraplane_deploy::QueueNotifier;
use tokio::sync::mpsc;
use tracing::debug;

/// Wakes the project's worker after a job was committed. Messages are
/// durable in the store; the channel only carries wake-ups.
#[derive(Debug, Clone)]
pub struct QueuePublisher {
    tx: mpsc::UnboundedSender<String>,
}

impl QueuePublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueueNotifier for QueuePublisher {
    fn notify(&self, project_id: &str) {
        if self.tx.send(project_id.to_string()).is_err() {
            // Picked up by `QueueManager::resume` on the next start.
            debug!(%project_id, "queue manager not running, wake-up dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_sends_project_ids() {
        let (publisher, mut rx) = QueuePublisher::channel();
        publisher.notify("p1");
        publisher.notify("p2");
        assert_eq!(rx.recv().await.as_deref(), Some("p1"));
        assert_eq!(rx.recv().await.as_deref(), Some("p2"));

        drop(rx);
        publisher.notify("p3");
    }
}
