use terraplane_compiler::CompileError;
use terraplane_deploy::DeployError;
use terraplane_executor::ExecError;
use terraplane_state::StateError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("{0}")]
    Deploy(#[from] DeployError),

    #[error("compile: {0}")]
    Compile(#[from] CompileError),

    #[error("executor: {0}")]
    Exec(#[from] ExecError),

    /// The deployment was already executing when its message was delivered,
    /// so an earlier run was cut short.
    #[error("deployment {0} was interrupted while executing")]
    Interrupted(String),
}

impl From<QueueError> for DeployError {
    /// The failure recorded on a deployment. Tool failures keep the captured
    /// output so the reason survives past the log retention.
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Deploy(e) => e,
            QueueError::Exec(ExecError::Failed { output, .. }) => DeployError::ExecutionFailed { output },
            other => DeployError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_failures_keep_their_output() {
        let err = QueueError::Exec(ExecError::Failed {
            command: "terraform apply".into(),
            code: Some(1),
            output: "Error: invalid CIDR".into(),
        });
        let failure = DeployError::from(err);
        assert!(matches!(&failure, DeployError::ExecutionFailed { output } if output == "Error: invalid CIDR"));
        assert_eq!(failure.to_string(), "execution failed: Error: invalid CIDR");
    }

    #[test]
    fn deploy_errors_pass_through() {
        let err = QueueError::Deploy(DeployError::NotFound("deployment d1".into()));
        assert!(matches!(DeployError::from(err), DeployError::NotFound(_)));

        let err = QueueError::Interrupted("d1".into());
        assert!(matches!(DeployError::from(err), DeployError::Internal(m) if m.contains("interrupted")));
    }
}
