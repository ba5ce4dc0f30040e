use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use spark_core::{JobId, SessionId};
use spark_recovery::{Classifier, CleanupHandler, ErrorKind, RecoveryEngine, TaskError};
use spark_resources::{FixedProbe, ResourceBudget, ResourceMonitor};
use spark_sessions::{ExecutorOptions, SessionExecutor, SessionStatus, TaskContext};
use spark_trajectory::{NewCheckpoint, SessionOutcome, TrajectoryRecorder, TrajectoryStore};

fn build(dir: &std::path::Path) -> SessionExecutor {
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

fn budget() -> ResourceBudget {
    ResourceBudget {
        max_duration_minutes: 30,
        ..ResourceBudget::unlimited()
    }
}

#[tokio::test(start_paused = true)]
async fn transient_network_errors_are_retried_until_success() {
    let dir = tempfile::tempdir().unwrap();
    let exec = build(dir.path());
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let task = move |ctx: TaskContext, _args: Value| {
        let counter = Arc::clone(&counter);
        async move {
            ctx.checkpoint(NewCheckpoint::phase("goal_generation")).await?;
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(TaskError::new(ErrorKind::Network, "connection reset"));
            }
            ctx.checkpoint(NewCheckpoint::phase("testing")).await?;
            Ok(json!("done"))
        }
    };

    let sid = exec
        .start(JobId::from("net"), "net", budget(), Arc::new(task), Value::Null)
        .await
        .unwrap();
    let session = exec.wait_for(&sid, Duration::from_secs(600)).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let t = exec.recorder().get_trajectory(&sid).await.unwrap().unwrap();
    let phases: Vec<&str> = t.checkpoints.iter().map(|c| c.phase.as_str()).collect();
    assert_eq!(
        phases.iter().filter(|p| **p == "goal_generation_error_handling").count(),
        2
    );
    assert!(t
        .checkpoints
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(t.checkpoints.last().unwrap().progress, 100.0);
    assert_eq!(t.quality_metrics["attempts"], 3.0);
    assert_eq!(t.quality_metrics["recovery_retries"], 2.0);
}

struct Counter(AtomicUsize);

#[async_trait]
impl CleanupHandler for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    async fn cleanup(&self, _session_id: &SessionId) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn auth_failure_terminates_gracefully_and_runs_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let exec = build(dir.path());
    let cleanup = Arc::new(Counter(AtomicUsize::new(0)));
    exec.recovery().add_cleanup_handler(cleanup.clone());

    let sid = exec
        .start(
            JobId::from("auth"),
            "auth",
            budget(),
            Arc::new(|_ctx: TaskContext, _args: Value| async {
                Err::<Value, _>(TaskError::new(ErrorKind::Auth, "token expired"))
            }),
            Value::Null,
        )
        .await
        .unwrap();
    let session = exec.wait_for(&sid, Duration::from_secs(5)).await.unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.outcome, Some(SessionOutcome::TerminatedGracefully));
    assert_eq!(cleanup.0.load(Ordering::SeqCst), 1);

    let t = exec.recorder().get_trajectory(&sid).await.unwrap().unwrap();
    assert_eq!(t.outcome, Some(SessionOutcome::TerminatedGracefully));
    assert!(t.checkpoints.iter().any(|c| c.phase == "graceful_termination"));
    // the error stays queryable after the session is archived
    let stats = exec.recovery().get_error_statistics(&sid);
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.by_kind["auth"], 1);
}

#[tokio::test]
#[allow(unreachable_code)]
async fn cancellation_is_observed_at_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let exec = build(dir.path());
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
    let ready_tx = Arc::new(std::sync::Mutex::new(Some(ready_tx)));

    let sid = exec
        .start(
            JobId::from("loop"),
            "loop",
            budget(),
            Arc::new(move |ctx: TaskContext, _args: Value| {
                let ready_tx = Arc::clone(&ready_tx);
                async move {
                    if let Some(tx) = ready_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    loop {
                        ctx.checkpoint(NewCheckpoint::phase("code_generation")).await?;
                        tokio::task::yield_now().await;
                    }
                    Ok::<Value, TaskError>(Value::Null)
                }
            }),
            Value::Null,
        )
        .await
        .unwrap();

    ready_rx.await.unwrap();
    assert!(exec.stop(&sid));
    let session = exec.wait_for(&sid, Duration::from_secs(5)).await.unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(exec.active_count(), 0);
}
