//! Buffered executor logs with periodic flushing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use terraplane_state::{LogStream, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ExecError, ExecResult};

/// Durable destination of log lines.
pub trait LogSink: Send + Sync {
    fn append(&self, scope: &str, lines: &[(LogStream, String)]) -> ExecResult<()>;
}

/// Writes log lines to the state store.
#[derive(Clone)]
pub struct StoreLogSink {
    store: StateStore,
}

impl StoreLogSink {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl LogSink for StoreLogSink {
    fn append(&self, scope: &str, lines: &[(LogStream, String)]) -> ExecResult<()> {
        self.store
            .append_logs(scope, lines)
            .map_err(|e| ExecError::Sink(e.to_string()))?;
        Ok(())
    }
}

/// In-memory line buffer shared between the process readers and the
/// flusher.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<(LogStream, String)>>>,
}

impl LogBuffer {
    pub fn push(&self, stream: LogStream, line: impl Into<String>) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push((stream, line.into()));
    }

    /// Lines written by the control plane rather than the tool.
    pub fn system(&self, line: impl Into<String>) {
        self.push(LogStream::System, line);
    }

    pub fn drain(&self) -> Vec<(LogStream, String)> {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *lines)
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn flush(sink: &dyn LogSink, scope: &str, buffer: &LogBuffer) {
    let lines = buffer.drain();
    if lines.is_empty() {
        return;
    }
    match sink.append(scope, &lines) {
        Ok(()) => debug!(%scope, lines = lines.len(), "log lines flushed"),
        Err(e) => warn!(%scope, error = %e, dropped = lines.len(), "log flush failed"),
    }
}

/// A log scope being written to. Flushes every `interval` until
/// [`LogSession::finish`], which flushes whatever is left.
pub struct LogSession {
    scope: String,
    buffer: LogBuffer,
    sink: Arc<dyn LogSink>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LogSession {
    pub fn start(sink: Arc<dyn LogSink>, scope: impl Into<String>, interval: Duration) -> Self {
        let scope = scope.into();
        let buffer = LogBuffer::default();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let sink = sink.clone();
            let scope = scope.clone();
            let buffer = buffer.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                // First tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => flush(sink.as_ref(), &scope, &buffer),
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        });

        Self {
            scope,
            buffer,
            sink,
            shutdown_tx,
            handle,
        }
    }

    pub fn buffer(&self) -> LogBuffer {
        self.buffer.clone()
    }

    /// Stop the flusher and write the remaining lines.
    pub async fn finish(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(scope = %self.scope, error = %e, "log flusher task failed");
        }
        flush(self.sink.as_ref(), &self.scope, &self.buffer);
    }
}
