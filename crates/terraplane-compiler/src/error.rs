use terraplane_core::VaultError;
use terraplane_core::rules::RuleError;
use terraplane_core::source::SourceError;
use terraplane_state::StateError;
use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid rule: {0}")]
    Rule(#[from] RuleError),

    #[error("module source: {0}")]
    Source(#[from] SourceError),

    #[error("vault: {0}")]
    Vault(#[from] VaultError),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
