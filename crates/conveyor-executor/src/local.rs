//! Local process executor implementation.

use async_trait::async_trait;
use conveyor_core::executor::{ExecOutcome, ExecSpec, StepExecutor};
use conveyor_core::{Error, Result};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

/// Runs steps as child processes on the local machine.
///
/// Children receive exactly the environment in the [`ExecSpec`]; nothing is
/// inherited from the orchestrator process. On timeout the child is killed.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessExecutor;

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepExecutor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, spec: ExecSpec) -> Result<ExecOutcome> {
        debug!(
            program = %spec.program,
            args = ?spec.args,
            working_dir = %spec.working_dir.display(),
            "spawning process"
        );

        let start = Instant::now();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            Error::ExecutionFailed(format!("failed to launch '{}': {}", spec.program, e))
        })?;

        let wait = child.wait_with_output();
        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                // Dropping the wait future reaps the child via kill_on_drop.
                Err(_) => return Err(Error::Timeout(limit)),
            },
            None => wait.await,
        }
        .map_err(|e| Error::ExecutionFailed(format!("failed to collect output: {}", e)))?;

        let outcome = ExecOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start.elapsed(),
        };

        debug!(
            program = %spec.program,
            exit_code = ?outcome.exit_code,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "process finished"
        );

        Ok(outcome)
    }
}
