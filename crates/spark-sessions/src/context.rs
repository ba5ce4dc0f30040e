use std::sync::{Arc, Mutex};

use serde_json::Value;
use spark_core::{JobId, SessionId};
use spark_recovery::TaskError;
use spark_trajectory::{NewCheckpoint, TrajectoryError, TrajectoryRecorder};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Phase reported to the recovery engine before the task writes any checkpoint.
pub const DEFAULT_PHASE: &str = "execution";

/// Handle passed to a running task function.
///
/// Cloning is cheap; all clones observe the same cancellation token and phase.
#[derive(Clone)]
pub struct TaskContext {
    session_id: SessionId,
    job_id: JobId,
    attempt: u32,
    approach: u32,
    cancel: CancellationToken,
    phase: Arc<Mutex<String>>,
    recorder: Arc<TrajectoryRecorder>,
}

impl TaskContext {
    pub(crate) fn new(
        session_id: SessionId,
        job_id: JobId,
        attempt: u32,
        approach: u32,
        cancel: CancellationToken,
        recorder: Arc<TrajectoryRecorder>,
    ) -> Self {
        Self {
            session_id,
            job_id,
            attempt,
            approach,
            cancel,
            phase: Arc::new(Mutex::new(DEFAULT_PHASE.to_string())),
            recorder,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// 1 for the first run, incremented on every retry or fallback.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 0 for the primary approach; `n` after the n-th fallback.
    pub fn approach(&self) -> u32 {
        self.approach
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Phase of the most recent checkpoint written through this context.
    pub fn phase(&self) -> String {
        self.phase
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Record progress and yield to cancellation.
    ///
    /// Returns a `Cancelled` error once the session has been stopped; the task
    /// should return it as-is. Persistence failures are logged, not returned.
    pub async fn checkpoint(&self, checkpoint: NewCheckpoint) -> Result<(), TaskError> {
        if self.is_cancelled() {
            return Err(TaskError::cancelled());
        }
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = checkpoint.phase.clone();
        match self
            .recorder
            .create_checkpoint(&self.session_id, checkpoint)
            .await
        {
            Ok(_) => {}
            // Finalized underneath us by a termination path.
            Err(TrajectoryError::NotActive { .. }) => return Err(TaskError::cancelled()),
            Err(e) => warn!(session_id = %self.session_id, "checkpoint write failed: {e}"),
        }
        if self.is_cancelled() {
            return Err(TaskError::cancelled());
        }
        Ok(())
    }

    /// Append an intermediate result to the latest checkpoint.
    pub async fn record_step(&self, step_type: &str, data: Value) {
        if let Err(e) = self
            .recorder
            .record_step(&self.session_id, step_type, data)
            .await
        {
            warn!(session_id = %self.session_id, step_type, "record_step failed: {e}");
        }
    }
}
