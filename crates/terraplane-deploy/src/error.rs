use terraplane_core::VaultError;
use terraplane_core::rules::RuleError;
use terraplane_graph::GraphError;
use terraplane_state::StateError;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded for {metric}: requested {requested}, available {available}")]
    QuotaExceeded {
        metric: String,
        available: u64,
        requested: u64,
    },

    #[error("execution failed: {output}")]
    ExecutionFailed { output: String },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Store failures are always internal; not-found and lost races surface
/// from the store as `None` and are classified by the service.
impl From<StateError> for DeployError {
    fn from(err: StateError) -> Self {
        DeployError::Internal(err.to_string())
    }
}

impl From<GraphError> for DeployError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::State(e) => e.into(),
            conflict => DeployError::Conflict(conflict.to_string()),
        }
    }
}

impl From<VaultError> for DeployError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound(id) => DeployError::NotFound(format!("secret {id}")),
            forbidden @ VaultError::Forbidden { .. } => DeployError::BadRequest(forbidden.to_string()),
            VaultError::Backend(e) => DeployError::Internal(e),
        }
    }
}

impl From<RuleError> for DeployError {
    fn from(err: RuleError) -> Self {
        DeployError::BadRequest(err.to_string())
    }
}
