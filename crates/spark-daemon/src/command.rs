//! Built-in `command` task: run a shell command as a session.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use spark_recovery::{ErrorKind, TaskError};
use spark_sessions::{TaskContext, TaskFunction};
use spark_trajectory::NewCheckpoint;
use tracing::debug;

use crate::truncate::{truncate_middle, DEFAULT_MAX_CHARS};

/// Name the daemon registers [`CommandTask`] under.
pub const COMMAND_TASK: &str = "command";

#[derive(Debug, Deserialize)]
struct CommandArgs {
    command: String,
    /// Per-attempt limit. The session's `max_duration_minutes` still applies.
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_max_chars")]
    max_output_chars: usize,
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

/// Runs `sh -c <command>` and returns its exit code and captured output.
///
/// A non-zero exit becomes an unclassified failure carrying the tail of
/// stderr, so recovery can still match transient causes such as "connection
/// refused" by message. The child is killed if the session is cancelled or
/// times out.
pub struct CommandTask;

#[async_trait]
impl TaskFunction for CommandTask {
    async fn run(&self, ctx: TaskContext, args: Value) -> Result<Value, TaskError> {
        let args: CommandArgs = serde_json::from_value(args)?;
        if args.command.trim().is_empty() {
            return Err(TaskError::new(ErrorKind::Validation, "empty command"));
        }

        ctx.checkpoint(
            NewCheckpoint::phase("command_started")
                .progress(10.0)
                .state(json!({ "command": args.command, "attempt": ctx.attempt() })),
        )
        .await?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&args.command)
            .envs(&args.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }

        debug!(session_id = %ctx.session_id(), command = %args.command, "spawning command");
        let started = Instant::now();
        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(TaskError::cancelled()),
            out = run_with_limit(&mut command, args.timeout_secs) => out?,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = truncate_middle(&String::from_utf8_lossy(&output.stdout), args.max_output_chars);
        let stderr = truncate_middle(&String::from_utf8_lossy(&output.stderr), args.max_output_chars);
        let result = json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
            "duration_ms": elapsed_ms,
        });
        ctx.record_step("command_output", result.clone()).await;

        if !output.status.success() {
            return Err(TaskError::unclassified(format!(
                "command exited with status {exit_code}: {}",
                last_line(&stderr)
            )));
        }

        ctx.checkpoint(
            NewCheckpoint::phase("command_finished")
                .progress(100.0)
                .result(result.clone()),
        )
        .await?;
        Ok(result)
    }
}

async fn run_with_limit(
    command: &mut tokio::process::Command,
    timeout_secs: Option<u64>,
) -> Result<std::process::Output, TaskError> {
    match timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), command.output())
            .await
            .map_err(|_| TaskError::new(ErrorKind::Timeout, format!("command timed out after {secs}s")))?
            .map_err(TaskError::from),
        None => command.output().await.map_err(TaskError::from),
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_core::JobId;
    use spark_recovery::{Classifier, RecoveryEngine};
    use spark_resources::{FixedProbe, ResourceBudget, ResourceMonitor};
    use spark_sessions::{ExecutorOptions, SessionExecutor, SessionStatus};
    use spark_trajectory::{SessionOutcome, TrajectoryRecorder, TrajectoryStore};
    use std::sync::Arc;

    fn executor(dir: &std::path::Path) -> SessionExecutor {
        let recorder = Arc::new(TrajectoryRecorder::new(
            TrajectoryStore::new(dir),
            ResourceMonitor::new(Arc::new(FixedProbe::idle())),
            Duration::from_secs(30),
        ));
        let recovery = Arc::new(RecoveryEngine::new(
            Arc::clone(&recorder),
            Classifier::with_defaults(),
        ));
        SessionExecutor::new(recorder, recovery, ExecutorOptions::default(), None)
    }

    async fn run(exec: &SessionExecutor, args: Value) -> spark_sessions::Session {
        let sid = exec
            .start(
                JobId::from("cmd"),
                "cmd",
                ResourceBudget::unlimited(),
                Arc::new(CommandTask),
                args,
            )
            .await
            .unwrap();
        exec.wait_for(&sid, Duration::from_secs(20)).await.unwrap()
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let s = run(&exec, json!({ "command": "echo hello; echo $GREETING", "env": { "GREETING": "hi" } })).await;
        assert_eq!(s.status, SessionStatus::Completed);
        let result = s.result.unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hello\nhi\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_skipped_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let s = run(&exec, json!({ "command": "echo warming up >&2; echo disk quota hit >&2; exit 3" })).await;
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.outcome, Some(SessionOutcome::Skipped));
        let err = s.error.unwrap();
        assert!(err.contains("status 3"));
        assert!(err.contains("disk quota hit"));
    }

    #[tokio::test]
    async fn missing_command_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let s = run(&exec, json!({ "cmd": "ls" })).await;
        assert_eq!(s.status, SessionStatus::Failed);
        assert!(s.error.unwrap().starts_with("validation"));
    }

    #[tokio::test]
    async fn stop_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let sid = exec
            .start(
                JobId::from("cmd"),
                "cmd",
                ResourceBudget::unlimited(),
                Arc::new(CommandTask),
                json!({ "command": "sleep 30" }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(exec.stop(&sid));
        let s = exec.wait_for(&sid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
    }

    #[test]
    fn last_line_skips_trailing_blanks() {
        assert_eq!(last_line("a\nb\n\n  \n"), "b");
        assert_eq!(last_line(""), "");
    }
}
