use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spark_core::{JobId, SessionId};
use spark_resources::ProcessUsage;

/// Phase written when a trajectory is opened.
pub const PHASE_SESSION_START: &str = "session_start";
/// Phase of the final checkpoint written by `complete_session`.
pub const PHASE_SESSION_COMPLETE: &str = "session_complete";

/// Progress implied by a well-known phase name.
pub fn phase_progress(phase: &str) -> f64 {
    match phase {
        PHASE_SESSION_START => 0.0,
        "goal_generation" => 20.0,
        "code_generation" => 50.0,
        "validation" => 70.0,
        "testing" => 85.0,
        "discovery_creation" => 100.0,
        _ => 50.0,
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
    TerminatedGracefully,
    EmergencyStopped,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Failed => "failed",
            SessionOutcome::Skipped => "skipped",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::TerminatedGracefully => "terminated_gracefully",
            SessionOutcome::EmergencyStopped => "emergency_stopped",
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    #[serde(default)]
    pub state: Value,
    /// Always within 0..=100.
    pub progress: f64,
    #[serde(default)]
    pub intermediate_results: Vec<Value>,
    #[serde(default)]
    pub resource_usage: ProcessUsage,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Builder for the caller-supplied part of a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct NewCheckpoint {
    pub phase: String,
    pub state: Value,
    /// Inferred from the phase when `None`.
    pub progress: Option<f64>,
    pub results: Vec<Value>,
    pub errors: Vec<String>,
}

impl NewCheckpoint {
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            state: Value::Object(Default::default()),
            ..Self::default()
        }
    }

    pub fn state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: Value) -> Self {
        self.results.push(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }
}

/// Running sums of the per-session process samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTotals {
    pub samples: u64,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub threads: u64,
    pub peak_memory_mb: f64,
}

impl ResourceTotals {
    pub fn add(&mut self, usage: &ProcessUsage) {
        self.samples += 1;
        self.cpu_percent += usage.cpu_percent;
        self.memory_mb += usage.memory_mb;
        self.threads += usage.threads;
        self.peak_memory_mb = self.peak_memory_mb.max(usage.memory_mb);
    }

    /// Mean usage over all samples, `None` before the first sample.
    pub fn average(&self) -> Option<ProcessUsage> {
        if self.samples == 0 {
            return None;
        }
        let n = self.samples as f64;
        Some(ProcessUsage {
            cpu_percent: self.cpu_percent / n,
            memory_mb: self.memory_mb / n,
            threads: self.threads / self.samples,
        })
    }
}

/// Full record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTrajectory {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub checkpoints: Vec<Checkpoint>,
    pub total_duration_secs: Option<f64>,
    #[serde(default)]
    pub resource_totals: ResourceTotals,
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub quality_metrics: BTreeMap<String, f64>,
}

impl SessionTrajectory {
    pub fn new(session_id: SessionId, job_id: JobId, job_name: impl Into<String>) -> Self {
        Self {
            session_id,
            job_id,
            job_name: job_name.into(),
            start_time: Utc::now(),
            end_time: None,
            checkpoints: Vec::new(),
            total_duration_secs: None,
            resource_totals: ResourceTotals::default(),
            outcome: None,
            quality_metrics: BTreeMap::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn error_count(&self) -> usize {
        self.checkpoints.iter().map(|c| c.errors.len()).sum()
    }
}

/// One row of [`SessionAnalytics::timeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub progress: f64,
    pub errors_count: usize,
    pub resource_usage: ProcessUsage,
}

/// Derived view of a trajectory for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnalytics {
    pub session_id: SessionId,
    pub duration_secs: Option<f64>,
    pub outcome: Option<SessionOutcome>,
    pub checkpoints_count: usize,
    pub quality_metrics: BTreeMap<String, f64>,
    pub resource_totals: ResourceTotals,
    pub timeline: Vec<TimelineEntry>,
    /// Seconds from the previous checkpoint to the last checkpoint of each phase.
    pub phase_durations: BTreeMap<String, f64>,
}

impl SessionAnalytics {
    pub fn from_trajectory(trajectory: &SessionTrajectory) -> Self {
        let timeline = trajectory
            .checkpoints
            .iter()
            .map(|c| TimelineEntry {
                timestamp: c.timestamp,
                phase: c.phase.clone(),
                progress: c.progress,
                errors_count: c.errors.len(),
                resource_usage: c.resource_usage.clone(),
            })
            .collect();

        let mut phase_durations = BTreeMap::new();
        for pair in trajectory.checkpoints.windows(2) {
            let secs = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64 / 1000.0;
            phase_durations.insert(pair[1].phase.clone(), secs);
        }

        Self {
            session_id: trajectory.session_id.clone(),
            duration_secs: trajectory.total_duration_secs,
            outcome: trajectory.outcome,
            checkpoints_count: trajectory.checkpoints.len(),
            quality_metrics: trajectory.quality_metrics.clone(),
            resource_totals: trajectory.resource_totals.clone(),
            timeline,
            phase_durations,
        }
    }
}
