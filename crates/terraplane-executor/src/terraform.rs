//! Subprocess executor for `terraform`-compatible tools.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use terraplane_state::LogStream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ExecError, ExecResult};
use crate::executor::{Executor, Run};
use crate::logs::LogBuffer;

/// Lines of captured output kept for a failure report.
const FAILURE_TAIL: usize = 200;

#[derive(Debug, Clone)]
pub struct TerraformExecutor {
    binary: String,
    /// Arguments placed before every subcommand (wrappers, scripts).
    base_args: Vec<String>,
    plan_file: String,
}

struct Captured {
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl TerraformExecutor {
    pub fn new(binary: impl Into<String>, plan_file: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args: Vec::new(),
            plan_file: plan_file.into(),
        }
    }

    pub fn with_base_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    /// Run one subcommand to completion. With `echo`, output lines are
    /// streamed into the run's log buffer; machine-readable output (which
    /// may hold sensitive values) is only captured.
    async fn run(&self, run: &Run, args: &[&str], echo: bool) -> ExecResult<Captured> {
        let command = format!("{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.base_args)
            .args(args)
            .current_dir(&run.dir)
            .envs(&run.env)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(%command, dir = %run.dir.display(), "running provisioning tool");
        if echo {
            run.log.system(format!("$ {command}"));
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let sink = echo.then(|| run.log.clone());

        let (stdout, stderr) = tokio::join!(
            read_lines(stdout, LogStream::Stdout, sink.as_ref()),
            read_lines(stderr, LogStream::Stderr, sink.as_ref()),
        );
        let status = child.wait().await?;
        let captured = Captured {
            stdout: stdout?,
            stderr: stderr?,
        };

        if !status.success() {
            let mut output: Vec<&str> = captured
                .stdout
                .iter()
                .chain(captured.stderr.iter())
                .map(String::as_str)
                .collect();
            if output.len() > FAILURE_TAIL {
                output.drain(..output.len() - FAILURE_TAIL);
            }
            return Err(ExecError::Failed {
                command,
                code: status.code(),
                output: output.join("\n"),
            });
        }
        Ok(captured)
    }
}

async fn read_lines<R>(
    reader: Option<R>,
    stream: LogStream,
    sink: Option<&LogBuffer>,
) -> ExecResult<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut lines = BufReader::new(reader).lines();
    let mut captured = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(sink) = sink {
            sink.push(stream, line.clone());
        }
        captured.push(line);
    }
    Ok(captured)
}

fn parse_json(command: &str, lines: &[String]) -> ExecResult<serde_json::Value> {
    serde_json::from_str(&lines.join("\n")).map_err(|e| ExecError::Output {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Executor for TerraformExecutor {
    async fn init(&self, run: &Run) -> ExecResult<()> {
        self.run(run, &["init", "-input=false", "-no-color"], true)
            .await?;
        Ok(())
    }

    async fn validate(&self, run: &Run) -> ExecResult<()> {
        self.run(run, &["validate", "-no-color"], true).await?;
        Ok(())
    }

    async fn plan(&self, run: &Run) -> ExecResult<serde_json::Value> {
        let out = format!("-out={}", self.plan_file);
        self.run(run, &["plan", "-input=false", "-no-color", &out], true)
            .await?;
        let shown = self
            .run(run, &["show", "-json", "-no-color", &self.plan_file], false)
            .await?;
        let plan = parse_json("show -json", &shown.stdout)?;
        info!(dir = %run.dir.display(), "plan rendered");
        Ok(plan)
    }

    async fn apply(&self, run: &Run) -> ExecResult<()> {
        self.run(
            run,
            &["apply", "-input=false", "-no-color", "-auto-approve"],
            true,
        )
        .await?;
        Ok(())
    }

    async fn refresh(&self, run: &Run) -> ExecResult<()> {
        self.run(run, &["refresh", "-input=false", "-no-color"], true)
            .await?;
        Ok(())
    }

    async fn output(&self, run: &Run) -> ExecResult<BTreeMap<String, serde_json::Value>> {
        let shown = self.run(run, &["output", "-json", "-no-color"], false).await?;
        let parsed = parse_json("output -json", &shown.stdout)?;
        let serde_json::Value::Object(entries) = parsed else {
            return Err(ExecError::Output {
                command: "output -json".to_string(),
                reason: "expected an object".to_string(),
            });
        };
        Ok(entries
            .into_iter()
            .map(|(name, entry)| {
                let value = entry.get("value").cloned().unwrap_or(entry);
                (name, value)
            })
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const FAKE_TOOL: &str = r#"
case "$1" in
  init) echo "Initializing the backend..."; echo "deprecated flag" 1>&2 ;;
  plan) echo "Plan: 1 to add"; echo "saved" > tfplan ;;
  show) echo '{"format_version":"1.2","planned_values":{}}' ;;
  output) echo '{"d_n1__id":{"sensitive":false,"type":"string","value":"net-123"}}' ;;
  apply) echo "password is $TF_VAR_d_n1__password"; echo "Error: quota" 1>&2; exit 3 ;;
  *) echo "$1 ok" ;;
esac
"#;

    fn setup() -> (tempfile::TempDir, TerraformExecutor, Run) {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-tool.sh");
        std::fs::write(&script, FAKE_TOOL).unwrap();
        let executor = TerraformExecutor::new("sh", "tfplan")
            .with_base_args(vec![script.display().to_string()]);
        let run = Run {
            dir: dir.path().to_path_buf(),
            env: BTreeMap::from([(
                "TF_VAR_d_n1__password".to_string(),
                "hunter2".to_string(),
            )]),
            log: LogBuffer::default(),
        };
        (dir, executor, run)
    }

    #[tokio::test]
    async fn init_streams_both_outputs() {
        let (_dir, executor, run) = setup();
        executor.init(&run).await.unwrap();

        let lines = run.log.drain();
        assert!(matches!(lines[0], (LogStream::System, _)));
        assert!(lines.contains(&(LogStream::Stdout, "Initializing the backend...".to_string())));
        assert!(lines.contains(&(LogStream::Stderr, "deprecated flag".to_string())));
    }

    #[tokio::test]
    async fn plan_writes_and_renders() {
        let (dir, executor, run) = setup();
        let plan = executor.plan(&run).await.unwrap();
        assert_eq!(plan["format_version"], "1.2");
        assert!(dir.path().join("tfplan").exists());
    }

    #[tokio::test]
    async fn output_values_are_unwrapped_and_not_logged() {
        let (_dir, executor, run) = setup();
        let outputs = executor.output(&run).await.unwrap();
        assert_eq!(outputs["d_n1__id"], "net-123");
        assert!(run.log.is_empty());
    }

    #[tokio::test]
    async fn failure_carries_output_and_env_is_scoped() {
        let (dir, executor, run) = setup();
        let err = executor.apply(&run).await.unwrap_err();
        match &err {
            ExecError::Failed { code, output, .. } => {
                assert_eq!(*code, Some(3));
                assert!(output.contains("password is hunter2"));
                assert!(output.contains("Error: quota"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let written: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| std::fs::read_to_string(e.unwrap().path()).unwrap_or_default())
            .collect();
        assert!(!written.iter().any(|content| content.contains("hunter2")));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let (_dir, _, run) = setup();
        let executor = TerraformExecutor::new("/nonexistent/terraform", "tfplan");
        assert!(matches!(
            executor.init(&run).await,
            Err(ExecError::Spawn { .. })
        ));
    }
}
