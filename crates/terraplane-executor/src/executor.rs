//! The provisioning tool command contract.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::ExecResult;
use crate::logs::LogBuffer;

/// One invocation context: the partition directory, the environment
/// scoped to this run (secrets included) and where output lines go.
#[derive(Clone)]
pub struct Run {
    pub dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log: LogBuffer,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("dir", &self.dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn init(&self, run: &Run) -> ExecResult<()>;

    async fn validate(&self, run: &Run) -> ExecResult<()>;

    /// Write a plan artifact and return its structured rendering.
    async fn plan(&self, run: &Run) -> ExecResult<serde_json::Value>;

    async fn apply(&self, run: &Run) -> ExecResult<()>;

    async fn refresh(&self, run: &Run) -> ExecResult<()>;

    /// Output name to value.
    async fn output(&self, run: &Run) -> ExecResult<BTreeMap<String, serde_json::Value>>;
}
