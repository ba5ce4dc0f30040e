use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spark_core::{JobId, SessionId};
use spark_resources::ResourceBudget;
use spark_trajectory::SessionOutcome;

/// Lifecycle of one session. `Running` moves to exactly one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    /// Hit `max_duration_minutes`. Kept apart from `Failed` so budget overruns
    /// can be told apart from task bugs.
    TimedOut,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub job_id: JobId,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Budget in effect for this run.
    pub budget: ResourceBudget,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Task invocations, including retries and fallbacks.
    pub attempts: u32,
    /// Finer-grained ending recorded in the trajectory.
    pub outcome: Option<SessionOutcome>,
}

impl Session {
    pub(crate) fn new(id: SessionId, job_id: JobId, job_name: &str, budget: ResourceBudget) -> Self {
        Self {
            id,
            job_id,
            job_name: job_name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Running,
            budget,
            result: None,
            error: None,
            attempts: 0,
            outcome: None,
        }
    }

    /// Wall-clock duration; up to now for a running session.
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!SessionStatus::Running.is_terminal());
        for s in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::TimedOut,
            SessionStatus::Cancelled,
        ] {
            assert!(s.is_terminal(), "{s}");
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
