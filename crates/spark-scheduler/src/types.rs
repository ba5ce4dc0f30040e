use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spark_core::{JobId, SessionId};
use spark_resources::ResourceBudget;
use spark_sessions::{Session, SessionStatus};
use spark_trajectory::SessionOutcome;

use crate::schedule::Schedule;

/// Scheduling state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its next_run time.
    Pending,
    /// Being dispatched right now.
    Running,
    /// Never dispatched until resumed.
    Paused,
    /// Last dispatch attempt failed; retried after backoff.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Which registered task function a job runs, and with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub function: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// One dispatch of a job, filled in when its session finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub(crate) fn started(session_id: SessionId, at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            started_at: at,
            finished_at: None,
            status: SessionStatus::Running,
            outcome: None,
            error: None,
        }
    }

    pub(crate) fn finish(&mut self, session: &Session) {
        self.finished_at = session.end_time;
        self.status = session.status;
        self.outcome = session.outcome;
        self.error = session.error.clone();
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    /// Human-readable label.
    pub name: String,
    pub schedule: Schedule,
    #[serde(default)]
    pub budget: ResourceBudget,
    pub task: TaskRef,
    pub status: JobStatus,
    /// `None` only while paused.
    pub next_run: Option<DateTime<Utc>>,
    /// Most recent dispatch attempt.
    pub last_run: Option<DateTime<Utc>>,
    /// Dispatch attempts, successful or not.
    #[serde(default)]
    pub run_count: u64,
    /// Failed dispatch attempts over the job's lifetime.
    #[serde(default)]
    pub failure_count: u64,
    /// Most recent executions, oldest first.
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

fn default_created_by() -> String {
    "system".to_string()
}

impl JobDefinition {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status != JobStatus::Paused && self.next_run.is_some_and(|t| t <= now)
    }

    /// Append `record`, dropping the oldest entries beyond `limit`.
    pub(crate) fn push_history(&mut self, record: ExecutionRecord, limit: usize) {
        self.history.push(record);
        let excess = self.history.len().saturating_sub(limit.max(1));
        if excess > 0 {
            self.history.drain(..excess);
        }
    }
}

/// Input to `Scheduler::add_task`.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub schedule: Schedule,
    pub task_function: String,
    pub task_args: Value,
    pub budget: ResourceBudget,
    pub tags: Vec<String>,
    pub created_by: String,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, schedule: Schedule, task_function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedule,
            task_function: task_function.into(),
            task_args: empty_args(),
            budget: ResourceBudget::default(),
            tags: Vec::new(),
            created_by: default_created_by(),
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.task_args = args;
        self
    }

    pub fn budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = who.into();
        self
    }
}

/// Host details reported by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub pid: u32,
    pub storage_path: String,
    pub use_local_time: bool,
}

/// Snapshot returned by `Scheduler::get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub paused_tasks: usize,
    pub failed_tasks: usize,
    pub active_sessions: usize,
    pub platform_info: PlatformInfo,
}

/// What one scheduler tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<SessionId>,
    /// Refused by the resource monitor and pushed back.
    pub deferred: usize,
    /// Dispatch attempted and rejected.
    pub failed: usize,
    /// Due but skipped: already running or task function missing.
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobDefinition {
        JobDefinition {
            id: JobId::from("j1"),
            name: "nightly".into(),
            schedule: Schedule::Daily { hour: 2, minute: 0 },
            budget: ResourceBudget::default(),
            task: TaskRef {
                function: "explore".into(),
                args: empty_args(),
            },
            status: JobStatus::Pending,
            next_run: None,
            last_run: None,
            run_count: 0,
            failure_count: 0,
            history: Vec::new(),
            tags: vec!["nightly".into()],
            created_at: Utc::now(),
            created_by: "test".into(),
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut j = job();
        for _ in 0..5 {
            j.push_history(ExecutionRecord::started(SessionId::new(), Utc::now()), 3);
        }
        assert_eq!(j.history.len(), 3);
    }

    #[test]
    fn paused_job_is_never_due() {
        let mut j = job();
        let now = Utc::now();
        j.next_run = Some(now);
        assert!(j.is_due(now));
        j.status = JobStatus::Paused;
        assert!(!j.is_due(now));
        j.status = JobStatus::Failed;
        j.next_run = None;
        assert!(!j.is_due(now));
    }

    #[test]
    fn status_parses_round_trip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Failed,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn older_records_without_optional_fields_load() {
        let json = r#"{
            "id": "j2",
            "name": "legacy",
            "schedule": {"kind": "weekdays", "hour": 3},
            "task": {"function": "explore"},
            "status": "pending",
            "next_run": "2024-01-08T03:00:00Z",
            "last_run": null,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let j: JobDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(j.schedule, Schedule::Weekdays { hour: 3, minute: 0 });
        assert_eq!(j.created_by, "system");
        assert_eq!(j.budget, ResourceBudget::default());
        assert!(j.task.args.is_object());
    }
}
