use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job definition itself is unusable (e.g. an empty name).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job names a task function nobody registered.
    #[error("Task function not registered: {name}")]
    TaskNotRegistered { name: String },

    #[error("Session error: {0}")]
    Session(#[from] spark_sessions::SessionError),

    #[error("Trajectory error: {0}")]
    Trajectory(#[from] spark_trajectory::TrajectoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
