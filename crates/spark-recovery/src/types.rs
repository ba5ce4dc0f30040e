use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spark_core::SessionId;

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Category attached to a task failure by the code that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    ResourceExhausted,
    Generation,
    Validation,
    Auth,
    Permission,
    /// The session was cancelled while the task was running.
    Cancelled,
    /// Untyped error from an external source; classified by message only.
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Generation => "generation",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a task function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error without a category; recovery falls back to message matching.
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "session cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Text the pattern table is matched against.
    pub fn match_text(&self) -> String {
        format!("{} {}", self.kind, self.message).to_lowercase()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match e.kind() {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => ErrorKind::Network,
            Io::PermissionDenied => ErrorKind::Permission,
            Io::OutOfMemory => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unclassified,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Validation, e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Recovery policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RetryWithBackoff,
    FallbackApproach,
    SkipAndContinue,
    GracefulTerminate,
    EmergencyStop,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::RetryWithBackoff => "retry_with_backoff",
            RecoveryAction::FallbackApproach => "fallback_approach",
            RecoveryAction::SkipAndContinue => "skip_and_continue",
            RecoveryAction::GracefulTerminate => "graceful_terminate",
            RecoveryAction::EmergencyStop => "emergency_stop",
        }
    }

    /// Actions that consume the strategy's retry budget.
    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            RecoveryAction::Retry | RecoveryAction::RetryWithBackoff | RecoveryAction::FallbackApproach
        )
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    Graceful,
    Emergency,
}

impl fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationKind::Graceful => f.write_str("graceful"),
            TerminationKind::Emergency => f.write_str("emergency"),
        }
    }
}

/// What the session should do after [`handle_error`](crate::RecoveryEngine::handle_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run the task again. Any backoff delay has already elapsed.
    Retry { attempt: u32 },
    /// Run the task again using alternate strategy number `approach`.
    Fallback { approach: u32 },
    /// Give up on this run without terminating anything else.
    Skip,
    /// The session was terminated and its trajectory finalized.
    Terminated(TerminationKind),
}

impl RecoveryDecision {
    pub fn reruns_task(&self) -> bool {
        matches!(
            self,
            RecoveryDecision::Retry { .. } | RecoveryDecision::Fallback { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One classified failure and how recovery escalated it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub kind: ErrorKind,
    pub message: String,
    pub severity: ErrorSeverity,
    /// Matched strategy, `None` for unmatched errors.
    pub strategy: Option<String>,
    pub action: RecoveryAction,
    /// Uses of the current action.
    pub retry_count: u32,
    /// Retries across every action of this record.
    pub total_retries: u32,
    pub resolved: bool,
    /// Number of times the same failure recurred after the record was opened.
    pub occurrences: u32,
    /// Position in the strategy's action list.
    #[serde(skip)]
    pub(crate) action_index: usize,
}

/// Aggregate error counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub resolved_errors: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub by_phase: BTreeMap<String, usize>,
    pub total_retries: u64,
    pub average_retries: f64,
}

impl ErrorStatistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ErrorRecord>) -> Self {
        let mut stats = ErrorStatistics::default();
        for r in records {
            stats.total_errors += 1;
            if r.resolved {
                stats.resolved_errors += 1;
            }
            *stats
                .by_severity
                .entry(r.severity.as_str().to_string())
                .or_default() += 1;
            *stats.by_kind.entry(r.kind.as_str().to_string()).or_default() += 1;
            *stats.by_phase.entry(r.phase.clone()).or_default() += 1;
            stats.total_retries += r.total_retries as u64;
        }
        if stats.total_errors > 0 {
            stats.average_retries = stats.total_retries as f64 / stats.total_errors as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_text_is_lowercase_kind_and_message() {
        let e = TaskError::new(ErrorKind::RateLimited, "Too Many Requests");
        assert_eq!(e.match_text(), "rate_limited too many requests");
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e: TaskError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(e.kind, ErrorKind::Timeout);
        let e: TaskError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no").into();
        assert_eq!(e.kind, ErrorKind::Permission);
        let e: TaskError = std::io::Error::new(std::io::ErrorKind::Other, "?").into();
        assert_eq!(e.kind, ErrorKind::Unclassified);
    }

    #[test]
    fn repeatable_actions() {
        assert!(RecoveryAction::RetryWithBackoff.is_repeatable());
        assert!(RecoveryAction::FallbackApproach.is_repeatable());
        assert!(!RecoveryAction::SkipAndContinue.is_repeatable());
        assert!(!RecoveryAction::GracefulTerminate.is_repeatable());
    }

    #[test]
    fn decision_rerun() {
        assert!(RecoveryDecision::Retry { attempt: 1 }.reruns_task());
        assert!(RecoveryDecision::Fallback { approach: 1 }.reruns_task());
        assert!(!RecoveryDecision::Skip.reruns_task());
        assert!(!RecoveryDecision::Terminated(TerminationKind::Graceful).reruns_task());
    }
}
