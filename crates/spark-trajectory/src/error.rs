use thiserror::Error;

/// Errors raised while recording or persisting trajectories.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    /// No active trajectory exists for the session (never started or already completed).
    #[error("session not active: {session_id}")]
    NotActive { session_id: String },

    /// `start_session` was called twice for the same session.
    #[error("session already recording: {session_id}")]
    AlreadyActive { session_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrajectoryError>;
