use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::ExecutionError;
use crate::worker::capability::{Availability, CallContext, CallOutput, Capability, LoaderContext};

/// Captured result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands as `<shell> -c <command>` with the minion's sandbox settings.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    config: SandboxConfig,
}

impl ShellExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn shell_exists(&self) -> bool {
        self.config.shell.exists()
    }

    pub async fn run(&self, command: &str) -> Result<CommandOutput, ExecutionError> {
        tracing::info!(command, shell = %self.config.shell.display(), "Executing command");

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        if self.config.clear_env {
            cmd.env_clear();
        }

        let output = match self.config.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), cmd.output())
                .await
                .map_err(|_| ExecutionError::CommandFailed(format!("command timed out after {ms} ms")))?,
            None => cmd.output().await,
        };

        Self::process_output(command, output)
    }

    fn process_output(
        command: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<CommandOutput, ExecutionError> {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
                let exit_code = output.status.code();

                tracing::info!(command, exit_code = ?exit_code, "Command finished");

                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Command failed to start");
                Err(ExecutionError::CommandFailed(e.to_string()))
            }
        }
    }
}

/// `cmd.run`: run a shell command, return its output, retcode = exit code.
#[derive(Debug, Clone)]
pub struct CmdRun {
    executor: ShellExecutor,
}

impl CmdRun {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            executor: ShellExecutor::new(config),
        }
    }
}

#[async_trait]
impl Capability for CmdRun {
    fn name(&self) -> &str {
        "cmd.run"
    }

    fn availability(&self, _ctx: &LoaderContext<'_>) -> Availability {
        if self.executor.shell_exists() {
            Availability::Available
        } else {
            Availability::Unavailable(format!(
                "shell {} not found",
                self.executor.config.shell.display()
            ))
        }
    }

    async fn invoke(
        &self,
        _ctx: &CallContext,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<CallOutput, ExecutionError> {
        let command = args
            .first()
            .or_else(|| kwargs.get("cmd"))
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutionError::InvalidArguments("cmd.run requires a command string".into()))?;

        let output = self.executor.run(command).await?;
        let retcode = output.exit_code.unwrap_or(1);
        // stderr follows stdout on failure
        let text = if output.success() || output.stderr.is_empty() {
            output.stdout
        } else if output.stdout.is_empty() {
            output.stderr
        } else {
            format!("{}\n{}", output.stdout, output.stderr)
        };
        Ok(CallOutput::with_retcode(json!(text), retcode))
    }
}
