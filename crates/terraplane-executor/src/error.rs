use thiserror::Error;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code:?}")]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("unreadable output from `{command}`: {reason}")]
    Output { command: String, reason: String },

    #[error("log sink error: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Captured tool output, when the failure carries any.
    pub fn output(&self) -> Option<&str> {
        match self {
            ExecError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}
