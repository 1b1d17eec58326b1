//! Hook between committed queue messages and the workers that consume them.

/// Told about a project whenever a job was committed to its queue.
pub trait QueueNotifier: Send + Sync {
    fn notify(&self, project_id: &str);
}

/// Leaves queued jobs for a later sweep; used where no workers run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl QueueNotifier for NoopNotifier {
    fn notify(&self, _project_id: &str) {}
}
