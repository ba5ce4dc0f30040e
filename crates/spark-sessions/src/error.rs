use thiserror::Error;

/// Errors that can occur when registering tasks or dispatching sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Per-job or global concurrency limit reached. Nothing was started.
    #[error("Concurrency limit exceeded for job {job_id}: {running} running, limit {limit}")]
    LimitExceeded {
        job_id: String,
        running: usize,
        limit: usize,
    },

    #[error("Invalid task name: {0}")]
    InvalidTaskName(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] spark_trajectory::TrajectoryError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
