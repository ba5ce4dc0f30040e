use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A strategy's match pattern failed to compile.
    #[error("invalid strategy pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// A strategy must name at least one action.
    #[error("strategy {name} has no recovery actions")]
    NoActions { name: String },
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
