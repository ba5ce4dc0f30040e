use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};
use spark_core::config::DEFAULT_HISTORY_LIMIT;
use spark_core::{JobId, SessionId};
use spark_recovery::{RecoveryDecision, RecoveryEngine, TaskError, TerminationKind};
use spark_resources::ResourceBudget;
use spark_trajectory::{SessionOutcome, TrajectoryError, TrajectoryRecorder};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::context::TaskContext;
use crate::error::{Result, SessionError};
use crate::registry::TaskFunction;
use crate::types::{Session, SessionStatus};

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Cap on Running sessions across all jobs. `None` means unbounded.
    pub max_global_sessions: Option<usize>,
    /// Finished sessions kept for queries; oldest are dropped first.
    pub history_limit: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_global_sessions: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl From<&spark_core::config::SchedulerConfig> for ExecutorOptions {
    fn from(config: &spark_core::config::SchedulerConfig) -> Self {
        Self {
            max_global_sessions: config.max_global_sessions,
            history_limit: config.history_limit,
        }
    }
}

struct ActiveSession {
    session: Session,
    cancel: CancellationToken,
    /// Set by `force_terminate`; the run loop turns the cancellation into an
    /// emergency stop.
    forced: Option<String>,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct SessionTable {
    active: HashMap<SessionId, ActiveSession>,
    history: VecDeque<Session>,
}

struct Shared {
    table: Mutex<SessionTable>,
    recorder: Arc<TrajectoryRecorder>,
    recovery: Arc<RecoveryEngine>,
    options: ExecutorOptions,
    events: Option<mpsc::Sender<Session>>,
}

enum RunOutcome {
    Completed(Value),
    Skipped(TaskError),
    Terminated(TerminationKind, TaskError),
    TimedOut,
    Cancelled,
}

/// Runs task functions as concurrency- and deadline-bounded sessions.
///
/// Cheap to clone; clones share the same session table. Every session runs
/// in its own Tokio task and ends in exactly one terminal [`SessionStatus`].
#[derive(Clone)]
pub struct SessionExecutor {
    shared: Arc<Shared>,
}

impl SessionExecutor {
    /// Pass `Some(tx)` to receive every finished [`Session`].
    pub fn new(
        recorder: Arc<TrajectoryRecorder>,
        recovery: Arc<RecoveryEngine>,
        options: ExecutorOptions,
        events: Option<mpsc::Sender<Session>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(SessionTable::default()),
                recorder,
                recovery,
                options,
                events,
            }),
        }
    }

    pub fn recorder(&self) -> &Arc<TrajectoryRecorder> {
        &self.shared.recorder
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        &self.shared.recovery
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Start a session for `job_id`.
    ///
    /// Fails with [`SessionError::LimitExceeded`] and no state change when the
    /// job already has `max_concurrent_sessions` running (0 means no per-job
    /// limit) or the global cap is reached. The limit check and the insert
    /// happen under one lock, so concurrent starts cannot overshoot.
    #[instrument(skip(self, budget, task, args), fields(job_id = %job_id))]
    pub async fn start(
        &self,
        job_id: JobId,
        job_name: &str,
        budget: ResourceBudget,
        task: Arc<dyn TaskFunction>,
        args: Value,
    ) -> Result<SessionId> {
        let session_id = SessionId::new();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut table = self.shared.lock();
            let running = table
                .active
                .values()
                .filter(|a| a.session.job_id == job_id)
                .count();
            let limit = budget.max_concurrent_sessions;
            if limit > 0 && running >= limit {
                return Err(SessionError::LimitExceeded {
                    job_id: job_id.to_string(),
                    running,
                    limit,
                });
            }
            if let Some(max) = self.shared.options.max_global_sessions {
                if table.active.len() >= max {
                    return Err(SessionError::LimitExceeded {
                        job_id: job_id.to_string(),
                        running: table.active.len(),
                        limit: max,
                    });
                }
            }
            table.active.insert(
                session_id.clone(),
                ActiveSession {
                    session: Session::new(session_id.clone(), job_id.clone(), job_name, budget.clone()),
                    cancel: cancel.clone(),
                    forced: None,
                    done: done_rx,
                },
            );
        }

        let initial_state = json!({
            "job_id": job_id,
            "job_name": job_name,
            "args": args,
            "budget": budget,
        });
        if let Err(e) = self
            .shared
            .recorder
            .start_session(session_id.clone(), job_id.clone(), job_name, initial_state)
            .await
        {
            self.shared.lock().active.remove(&session_id);
            return Err(e.into());
        }

        info!(session_id = %session_id, job_name, "session started");
        let shared = Arc::clone(&self.shared);
        let sid = session_id.clone();
        tokio::spawn(async move {
            shared
                .run(sid, job_id, task, args, budget.max_duration(), cancel, done_tx)
                .await;
        });
        Ok(session_id)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cooperatively cancel a running session. It ends as `Cancelled`.
    pub fn stop(&self, session_id: &SessionId) -> bool {
        match self.shared.lock().active.get(session_id) {
            Some(active) => {
                info!(%session_id, "stopping session");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and hand the session to the recovery engine's emergency stop.
    /// It ends as `Failed` with outcome `emergency_stopped`.
    pub fn force_terminate(&self, session_id: &SessionId, reason: &str) -> bool {
        match self.shared.lock().active.get_mut(session_id) {
            Some(active) => {
                warn!(%session_id, reason, "force terminating session");
                active.forced = Some(reason.to_string());
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running session of `job_id`. Returns how many were signalled.
    pub fn stop_job(&self, job_id: &JobId) -> usize {
        let table = self.shared.lock();
        let mut n = 0;
        for active in table.active.values().filter(|a| &a.session.job_id == job_id) {
            active.cancel.cancel();
            n += 1;
        }
        if n > 0 {
            info!(%job_id, sessions = n, "stopping job sessions");
        }
        n
    }

    pub fn stop_all(&self) -> usize {
        let table = self.shared.lock();
        for active in table.active.values() {
            active.cancel.cancel();
        }
        table.active.len()
    }

    /// Cancel everything and wait up to `timeout` for sessions to finish.
    /// Returns the number still running when the wait gave up.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let stopped = self.stop_all();
        if stopped > 0 {
            info!(sessions = stopped, "waiting for sessions to stop");
        }
        let waiters: Vec<watch::Receiver<bool>> = self
            .shared
            .lock()
            .active
            .values()
            .map(|a| a.done.clone())
            .collect();
        let all = futures_util::future::join_all(waiters.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|done| *done).await;
        }));
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("timed out waiting for sessions to stop");
        }
        self.active_count()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Active or archived session by id.
    pub fn get(&self, session_id: &SessionId) -> Option<Session> {
        let table = self.shared.lock();
        if let Some(active) = table.active.get(session_id) {
            return Some(active.session.clone());
        }
        table.history.iter().rev().find(|s| &s.id == session_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .shared
            .lock()
            .active
            .values()
            .map(|a| a.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        sessions
    }

    /// Finished sessions, oldest first.
    pub fn history(&self) -> Vec<Session> {
        self.shared.lock().history.iter().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    pub fn running_for_job(&self, job_id: &JobId) -> usize {
        self.shared
            .lock()
            .active
            .values()
            .filter(|a| &a.session.job_id == job_id)
            .count()
    }

    /// Wait up to `timeout` for the session to finish and return its latest
    /// state (still `Running` if the wait timed out).
    pub async fn wait_for(&self, session_id: &SessionId, timeout: Duration) -> Option<Session> {
        let rx = self
            .shared
            .lock()
            .active
            .get(session_id)
            .map(|a| a.done.clone());
        if let Some(mut rx) = rx {
            let _ = tokio::time::timeout(timeout, rx.wait_for(|done| *done)).await;
        }
        self.get(session_id)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        self: Arc<Self>,
        session_id: SessionId,
        job_id: JobId,
        task: Arc<dyn TaskFunction>,
        args: Value,
        max_duration: Duration,
        cancel: CancellationToken,
        done_tx: watch::Sender<bool>,
    ) {
        let attempts = self.attempt_loop(&session_id, &job_id, task, args, &cancel);
        // A zero duration budget means no deadline.
        let outcome = if max_duration.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => RunOutcome::Cancelled,
                o = attempts => o,
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => RunOutcome::Cancelled,
                r = tokio::time::timeout(max_duration, attempts) => r.unwrap_or(RunOutcome::TimedOut),
            }
        };
        // Release anything the task spawned under this token.
        cancel.cancel();

        let forced = self
            .lock()
            .active
            .get(&session_id)
            .and_then(|a| a.forced.clone());

        let (status, outcome, result, err) = match outcome {
            RunOutcome::Completed(value) => {
                (SessionStatus::Completed, SessionOutcome::Completed, Some(value), None)
            }
            RunOutcome::Skipped(e) => {
                (SessionStatus::Failed, SessionOutcome::Skipped, None, Some(e.to_string()))
            }
            RunOutcome::Terminated(kind, e) => {
                let outcome = match kind {
                    TerminationKind::Graceful => SessionOutcome::TerminatedGracefully,
                    TerminationKind::Emergency => SessionOutcome::EmergencyStopped,
                };
                (SessionStatus::Failed, outcome, None, Some(e.to_string()))
            }
            RunOutcome::TimedOut => (
                SessionStatus::TimedOut,
                SessionOutcome::TimedOut,
                None,
                Some(format!(
                    "exceeded max duration of {} minutes",
                    max_duration.as_secs() / 60
                )),
            ),
            RunOutcome::Cancelled => match forced {
                Some(reason) => {
                    self.recovery
                        .force_terminate_session(&session_id, &reason)
                        .await;
                    (
                        SessionStatus::Failed,
                        SessionOutcome::EmergencyStopped,
                        None,
                        Some(format!("force terminated: {reason}")),
                    )
                }
                None => (
                    SessionStatus::Cancelled,
                    SessionOutcome::Cancelled,
                    None,
                    Some("session cancelled".to_string()),
                ),
            },
        };

        let attempts = self
            .lock()
            .active
            .get(&session_id)
            .map(|a| a.session.attempts)
            .unwrap_or_default();
        self.finalize_trajectory(&session_id, outcome, attempts).await;

        let finished = {
            let mut table = self.lock();
            let Some(active) = table.active.remove(&session_id) else {
                error!(%session_id, "finished session missing from the active table");
                return;
            };
            let mut session = active.session;
            session.status = status;
            session.end_time = Some(Utc::now());
            session.result = result;
            session.error = err;
            session.outcome = Some(outcome);
            table.history.push_back(session.clone());
            let limit = self.options.history_limit.max(1);
            while table.history.len() > limit {
                table.history.pop_front();
            }
            session
        };

        match finished.status {
            SessionStatus::Completed => info!(
                %session_id,
                attempts,
                duration_secs = finished.duration().num_seconds(),
                "session completed"
            ),
            SessionStatus::Cancelled => info!(%session_id, "session cancelled"),
            _ => warn!(
                %session_id,
                status = %finished.status,
                outcome = %outcome,
                "session ended: {}",
                finished.error.as_deref().unwrap_or("")
            ),
        }

        // Queue the event before waking waiters so anyone woken by `done` can
        // already drain it. A full channel must not hold up `wait_for`.
        let Some(tx) = &self.events else {
            let _ = done_tx.send(true);
            return;
        };
        match tx.try_send(finished) {
            Ok(()) => {
                let _ = done_tx.send(true);
            }
            Err(mpsc::error::TrySendError::Full(finished)) => {
                let _ = done_tx.send(true);
                if tx.send(finished).await.is_err() {
                    debug!(%session_id, "session event receiver dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = done_tx.send(true);
                debug!(%session_id, "session event receiver dropped");
            }
        }
    }

    /// Run the task, feeding failures through the recovery engine until it
    /// succeeds or recovery stops rerunning it.
    async fn attempt_loop(
        &self,
        session_id: &SessionId,
        job_id: &JobId,
        task: Arc<dyn TaskFunction>,
        args: Value,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut attempt = 0u32;
        let mut approach = 0u32;
        loop {
            attempt += 1;
            if let Some(active) = self.lock().active.get_mut(session_id) {
                active.session.attempts = attempt;
            }
            let ctx = TaskContext::new(
                session_id.clone(),
                job_id.clone(),
                attempt,
                approach,
                cancel.clone(),
                Arc::clone(&self.recorder),
            );

            let run = AssertUnwindSafe(task.run(ctx.clone(), args.clone()))
                .catch_unwind()
                .await;
            let err = match run {
                Ok(Ok(value)) => return RunOutcome::Completed(value),
                Ok(Err(e)) => e,
                Err(panic) => TaskError::unclassified(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            if err.is_cancelled() || cancel.is_cancelled() {
                return RunOutcome::Cancelled;
            }

            debug!(%session_id, attempt, approach, "task failed: {err}");
            match self
                .recovery
                .handle_error(session_id, &ctx.phase(), &err)
                .await
            {
                RecoveryDecision::Retry { .. } => {}
                RecoveryDecision::Fallback { approach: n } => approach = n,
                RecoveryDecision::Skip => return RunOutcome::Skipped(err),
                RecoveryDecision::Terminated(kind) => return RunOutcome::Terminated(kind, err),
            }
        }
    }

    /// Close the trajectory unless a termination path already did, then hand
    /// the session's error records over to bounded retention.
    async fn finalize_trajectory(&self, session_id: &SessionId, outcome: SessionOutcome, attempts: u32) {
        let stats = self.recovery.get_error_statistics(session_id);
        let metrics = BTreeMap::from([
            ("attempts".to_string(), attempts as f64),
            ("recovery_errors".to_string(), stats.total_errors as f64),
            ("recovery_retries".to_string(), stats.total_retries as f64),
        ]);
        if self.recorder.is_active(session_id) {
            match self
                .recorder
                .complete_session(session_id, outcome, metrics)
                .await
            {
                Ok(_) | Err(TrajectoryError::NotActive { .. }) => {}
                Err(e) => error!(%session_id, "failed to finalize trajectory: {e}"),
            }
        }
        self.recovery.finish_session(session_id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
