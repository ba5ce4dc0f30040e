//! `spark-recovery` - failure classification and the recovery state machine.
//!
//! # Overview
//!
//! A failing task function returns a [`TaskError`] tagged with an
//! [`ErrorKind`]. The [`RecoveryEngine`] matches it against an ordered table
//! of [`RecoveryStrategy`] entries (typed kind first, then a case-insensitive
//! pattern over `"{kind} {message}"`), records an [`ErrorRecord`], writes an
//! error checkpoint and decides what the session does next.
//!
//! # Default strategies
//!
//! | Strategy            | Severity | Actions                         | Retries | Delay       |
//! |---------------------|----------|---------------------------------|---------|-------------|
//! | `network`           | Medium   | retry w/ backoff → fallback     | 3       | 5 s × 2ⁿ    |
//! | `rate_limit`        | Medium   | retry w/ backoff                | 5       | 60 s × 3ⁿ   |
//! | `resource_exhausted`| Critical | graceful terminate              | 1       | -           |
//! | `generation`        | Medium   | fallback → skip                 | 2       | -           |
//! | `auth`              | High     | graceful terminate              | 1       | -           |
//!
//! Unmatched errors are skipped. When a strategy's action list runs out the
//! session is terminated gracefully.

pub mod classifier;
pub mod engine;
pub mod error;
pub mod types;

pub use classifier::{default_strategies, Classifier, RecoveryStrategy};
pub use engine::{CleanupHandler, RecoveryEngine, TerminationCallback};
pub use error::{RecoveryError, Result};
pub use types::{
    ErrorKind, ErrorRecord, ErrorSeverity, ErrorStatistics, RecoveryAction, RecoveryDecision,
    TaskError, TerminationKind,
};
