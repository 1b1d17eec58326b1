use terraplane_state::StateError;
use thiserror::Error;

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("resource {0} cannot depend on itself")]
    SelfEdge(String),

    #[error("edge {dependent} -> {dependency} would create a cycle")]
    Cycle { dependent: String, dependency: String },

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl GraphError {
    /// Self-edges and cycles are conflicts; everything else is internal.
    pub fn is_conflict(&self) -> bool {
        matches!(self, GraphError::SelfEdge(_) | GraphError::Cycle { .. })
    }
}
