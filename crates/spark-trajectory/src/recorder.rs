use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use spark_core::{JobId, SessionId};
use spark_resources::{CpuBaseline, ProcessUsage, ResourceMonitor};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Result, TrajectoryError};
use crate::store::TrajectoryStore;
use crate::types::{
    phase_progress, Checkpoint, NewCheckpoint, SessionAnalytics, SessionOutcome,
    SessionTrajectory, PHASE_SESSION_COMPLETE, PHASE_SESSION_START,
};

/// Observer notified after every checkpoint of one session.
pub trait CheckpointListener: Send + Sync {
    fn on_checkpoint(&self, checkpoint: &Checkpoint);
}

impl<F> CheckpointListener for F
where
    F: Fn(&Checkpoint) + Send + Sync,
{
    fn on_checkpoint(&self, checkpoint: &Checkpoint) {
        self(checkpoint)
    }
}

struct ActiveTrajectory {
    /// Serializes checkpoint writes for this session only.
    trajectory: Arc<Mutex<SessionTrajectory>>,
    /// CPU% baseline for this session's usage readings.
    cpu: Arc<std::sync::Mutex<CpuBaseline>>,
    sampler: CancellationToken,
}

/// Records checkpoints for running sessions and persists them.
///
/// Share as `Arc<TrajectoryRecorder>`. Sessions are independent: writes to
/// different sessions never contend on the same lock.
pub struct TrajectoryRecorder {
    active: DashMap<SessionId, ActiveTrajectory>,
    listeners: DashMap<SessionId, Vec<Arc<dyn CheckpointListener>>>,
    store: TrajectoryStore,
    monitor: ResourceMonitor,
    sample_interval: Duration,
}

impl TrajectoryRecorder {
    pub fn new(store: TrajectoryStore, monitor: ResourceMonitor, sample_interval: Duration) -> Self {
        Self {
            active: DashMap::new(),
            listeners: DashMap::new(),
            store,
            monitor,
            // interval() panics on a zero period
            sample_interval: sample_interval.max(Duration::from_secs(1)),
        }
    }

    /// Open a trajectory with a `session_start` checkpoint at 0 % and start the
    /// resource sampler for it.
    #[instrument(skip(self, initial_state), fields(session_id = %session_id))]
    pub async fn start_session(
        &self,
        session_id: SessionId,
        job_id: JobId,
        job_name: &str,
        initial_state: Value,
    ) -> Result<Checkpoint> {
        if self.active.contains_key(&session_id) {
            return Err(TrajectoryError::AlreadyActive {
                session_id: session_id.to_string(),
            });
        }

        let mut trajectory = SessionTrajectory::new(session_id.clone(), job_id, job_name);
        let cpu = Arc::new(std::sync::Mutex::new(CpuBaseline::default()));
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            timestamp: trajectory.start_time,
            phase: PHASE_SESSION_START.to_string(),
            state: initial_state,
            progress: 0.0,
            intermediate_results: Vec::new(),
            resource_usage: process_usage(&self.monitor, &cpu),
            errors: Vec::new(),
        };
        trajectory.checkpoints.push(checkpoint.clone());
        self.store.save(&trajectory)?;

        let trajectory = Arc::new(Mutex::new(trajectory));
        let sampler = CancellationToken::new();
        tokio::spawn(sample_resources(
            Arc::clone(&trajectory),
            Arc::clone(&cpu),
            self.monitor.clone(),
            self.sample_interval,
            sampler.clone(),
        ));
        self.active.insert(
            session_id,
            ActiveTrajectory {
                trajectory,
                cpu,
                sampler,
            },
        );

        info!("trajectory recording started");
        Ok(checkpoint)
    }

    /// Append a checkpoint. Progress defaults to the phase's mapped value and
    /// is clamped to 0..=100; timestamps never go backwards within a session.
    #[instrument(skip(self, input), fields(session_id = %session_id, phase = %input.phase))]
    pub async fn create_checkpoint(
        &self,
        session_id: &SessionId,
        input: NewCheckpoint,
    ) -> Result<Checkpoint> {
        let (handle, cpu) = self
            .active
            .get(session_id)
            .map(|e| (Arc::clone(&e.trajectory), Arc::clone(&e.cpu)))
            .ok_or_else(|| not_active(session_id))?;
        let checkpoint = {
            let mut trajectory = handle.lock().await;
            if trajectory.is_finished() {
                return Err(not_active(session_id));
            }

            let progress = input
                .progress
                .unwrap_or_else(|| phase_progress(&input.phase))
                .clamp(0.0, 100.0);
            let mut timestamp = Utc::now();
            if let Some(last) = trajectory.last_checkpoint() {
                timestamp = timestamp.max(last.timestamp);
            }

            let checkpoint = Checkpoint {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.clone(),
                timestamp,
                phase: input.phase,
                state: input.state,
                progress,
                intermediate_results: input.results,
                resource_usage: process_usage(&self.monitor, &cpu),
                errors: input.errors,
            };
            trajectory.checkpoints.push(checkpoint.clone());
            self.store.save(&trajectory)?;
            checkpoint
        };

        debug!(progress = checkpoint.progress, "checkpoint recorded");
        self.notify(session_id, &checkpoint);
        Ok(checkpoint)
    }

    /// Attach a step record to the latest checkpoint. A session that is not
    /// recording is ignored.
    pub async fn record_step(
        &self,
        session_id: &SessionId,
        step_type: &str,
        data: Value,
    ) -> Result<()> {
        let handle = match self.handle(session_id) {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        let mut trajectory = handle.lock().await;
        if trajectory.is_finished() {
            return Ok(());
        }
        let step = json!({
            "step_type": step_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        if let Some(last) = trajectory.checkpoints.last_mut() {
            last.intermediate_results.push(step);
        }
        self.store.save(&trajectory)?;
        Ok(())
    }

    /// Close the trajectory: final `session_complete` checkpoint at 100 %,
    /// quality metrics, persist, and move out of the active set.
    ///
    /// `metrics` are merged over the computed quality metrics.
    #[instrument(skip(self, metrics), fields(session_id = %session_id, outcome = %outcome))]
    pub async fn complete_session(
        &self,
        session_id: &SessionId,
        outcome: SessionOutcome,
        metrics: BTreeMap<String, f64>,
    ) -> Result<SessionTrajectory> {
        let (_, active) = self
            .active
            .remove(session_id)
            .ok_or_else(|| not_active(session_id))?;
        active.sampler.cancel();
        self.listeners.remove(session_id);

        let mut trajectory = active.trajectory.lock().await;
        let now = Utc::now();
        let end_time = match trajectory.last_checkpoint() {
            Some(last) => now.max(last.timestamp),
            None => now,
        };
        let duration = (end_time - trajectory.start_time).num_milliseconds() as f64 / 1000.0;
        trajectory.end_time = Some(end_time);
        trajectory.total_duration_secs = Some(duration);
        trajectory.outcome = Some(outcome);
        trajectory.quality_metrics = quality_metrics(&trajectory, outcome, duration, metrics);

        let state = json!({
            "outcome": outcome,
            "total_duration": duration,
            "quality_metrics": trajectory.quality_metrics,
        });
        let final_checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            timestamp: end_time,
            phase: PHASE_SESSION_COMPLETE.to_string(),
            state,
            progress: 100.0,
            intermediate_results: Vec::new(),
            resource_usage: process_usage(&self.monitor, &active.cpu),
            errors: Vec::new(),
        };
        trajectory.checkpoints.push(final_checkpoint);
        self.store.save(&trajectory)?;

        info!(
            checkpoints = trajectory.checkpoints.len(),
            duration_secs = duration,
            "trajectory completed"
        );
        Ok(trajectory.clone())
    }

    pub fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// The live trajectory when active, otherwise the archived copy on disk.
    pub async fn get_trajectory(&self, session_id: &SessionId) -> Result<Option<SessionTrajectory>> {
        if let Ok(handle) = self.handle(session_id) {
            return Ok(Some(handle.lock().await.clone()));
        }
        self.store.load(session_id)
    }

    pub async fn analytics(&self, session_id: &SessionId) -> Result<Option<SessionAnalytics>> {
        Ok(self
            .get_trajectory(session_id)
            .await?
            .as_ref()
            .map(SessionAnalytics::from_trajectory))
    }

    /// Register a listener for one session's checkpoints. Dropped on completion.
    pub fn add_checkpoint_listener(
        &self,
        session_id: &SessionId,
        listener: Arc<dyn CheckpointListener>,
    ) {
        self.listeners
            .entry(session_id.clone())
            .or_default()
            .push(listener);
    }

    // --- private helpers ---------------------------------------------------

    fn handle(&self, session_id: &SessionId) -> Result<Arc<Mutex<SessionTrajectory>>> {
        // Clone the Arc out so the map shard is not held across an await.
        self.active
            .get(session_id)
            .map(|e| Arc::clone(&e.trajectory))
            .ok_or_else(|| not_active(session_id))
    }

    fn notify(&self, session_id: &SessionId, checkpoint: &Checkpoint) {
        let listeners: Vec<Arc<dyn CheckpointListener>> = match self.listeners.get(session_id) {
            Some(l) => l.clone(),
            None => return,
        };
        for listener in listeners {
            listener.on_checkpoint(checkpoint);
        }
    }
}

fn not_active(session_id: &SessionId) -> TrajectoryError {
    TrajectoryError::NotActive {
        session_id: session_id.to_string(),
    }
}

fn quality_metrics(
    trajectory: &SessionTrajectory,
    outcome: SessionOutcome,
    duration_secs: f64,
    extra: BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let checkpoints = trajectory.checkpoints.len();
    let error_rate = if checkpoints == 0 {
        0.0
    } else {
        trajectory.error_count() as f64 / checkpoints as f64
    };
    let completion_rate = if outcome == SessionOutcome::Completed {
        1.0
    } else {
        0.0
    };

    let mut metrics = BTreeMap::from([
        ("completion_rate".to_string(), completion_rate),
        ("error_rate".to_string(), error_rate),
        ("checkpoints".to_string(), checkpoints as f64),
        ("duration_secs".to_string(), duration_secs),
    ]);
    metrics.extend(extra);
    metrics
}

fn process_usage(monitor: &ResourceMonitor, cpu: &std::sync::Mutex<CpuBaseline>) -> ProcessUsage {
    let mut baseline = cpu.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    monitor.process_usage(&mut baseline)
}

/// Accumulate process usage into the trajectory until cancelled.
async fn sample_resources(
    trajectory: Arc<Mutex<SessionTrajectory>>,
    cpu: Arc<std::sync::Mutex<CpuBaseline>>,
    monitor: ResourceMonitor,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let usage = process_usage(&monitor, &cpu);
                let mut t = trajectory.lock().await;
                if t.is_finished() {
                    break;
                }
                t.resource_totals.add(&usage);
            }
        }
    }
    let session_id = trajectory.lock().await.session_id.clone();
    debug!(%session_id, "resource sampler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_resources::FixedProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(dir: &std::path::Path) -> (TrajectoryRecorder, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe::idle());
        let monitor = ResourceMonitor::new(probe.clone());
        let recorder =
            TrajectoryRecorder::new(TrajectoryStore::new(dir), monitor, Duration::from_secs(30));
        (recorder, probe)
    }

    #[tokio::test]
    async fn start_writes_initial_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();

        let cp = rec
            .start_session(sid.clone(), JobId::from("j"), "job", json!({"goal": "x"}))
            .await
            .unwrap();
        assert_eq!(cp.phase, "session_start");
        assert_eq!(cp.progress, 0.0);
        assert!(rec.is_active(&sid));
        assert!(TrajectoryStore::new(dir.path()).load(&sid).unwrap().is_some());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        let err = rec
            .start_session(sid, JobId::from("j"), "job", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, TrajectoryError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn progress_inferred_and_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();

        let cp = rec
            .create_checkpoint(&sid, NewCheckpoint::phase("validation"))
            .await
            .unwrap();
        assert_eq!(cp.progress, 70.0);

        let cp = rec
            .create_checkpoint(&sid, NewCheckpoint::phase("custom").progress(250.0))
            .await
            .unwrap();
        assert_eq!(cp.progress, 100.0);
    }

    #[tokio::test]
    async fn completed_trajectory_is_ordered_and_ends_at_100() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        for phase in ["goal_generation", "code_generation", "testing"] {
            rec.create_checkpoint(&sid, NewCheckpoint::phase(phase).error("warn"))
                .await
                .unwrap();
        }

        let done = rec
            .complete_session(&sid, SessionOutcome::Completed, BTreeMap::new())
            .await
            .unwrap();

        assert!(!rec.is_active(&sid));
        assert!(done
            .checkpoints
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        let last = done.checkpoints.last().unwrap();
        assert_eq!(last.phase, "session_complete");
        assert_eq!(last.progress, 100.0);
        assert_eq!(done.quality_metrics["completion_rate"], 1.0);
        // 3 errors over 4 checkpoints at completion time
        assert_eq!(done.quality_metrics["error_rate"], 0.75);

        // archived copy is served from disk
        let archived = rec.get_trajectory(&sid).await.unwrap().unwrap();
        assert_eq!(archived.outcome, Some(SessionOutcome::Completed));
    }

    #[tokio::test]
    async fn checkpoint_after_completion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        rec.complete_session(&sid, SessionOutcome::Failed, BTreeMap::new())
            .await
            .unwrap();
        let err = rec
            .create_checkpoint(&sid, NewCheckpoint::phase("testing"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrajectoryError::NotActive { .. }));
        assert!(rec
            .complete_session(&sid, SessionOutcome::Failed, BTreeMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn record_step_appends_to_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        rec.record_step(&sid, "llm_call", json!({"tokens": 12}))
            .await
            .unwrap();
        // unknown sessions are ignored
        rec.record_step(&SessionId::new(), "noop", Value::Null)
            .await
            .unwrap();

        let t = rec.get_trajectory(&sid).await.unwrap().unwrap();
        let results = &t.checkpoints[0].intermediate_results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["step_type"], "llm_call");
    }

    #[tokio::test]
    async fn listeners_see_each_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        rec.add_checkpoint_listener(
            &sid,
            Arc::new(move |_: &Checkpoint| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        rec.create_checkpoint(&sid, NewCheckpoint::phase("testing"))
            .await
            .unwrap();
        rec.create_checkpoint(&sid, NewCheckpoint::phase("testing"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_accumulates_process_usage() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, probe) = recorder(dir.path());
        probe.set_process_usage(ProcessUsage {
            cpu_percent: 5.0,
            memory_mb: 64.0,
            threads: 3,
        });
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();

        // immediate tick plus two 30 s ticks
        tokio::time::sleep(Duration::from_secs(61)).await;
        let t = rec.get_trajectory(&sid).await.unwrap().unwrap();
        assert_eq!(t.resource_totals.samples, 3);
        assert_eq!(t.resource_totals.threads, 9);
        assert_eq!(t.resource_totals.peak_memory_mb, 64.0);
    }

    #[tokio::test]
    async fn analytics_include_phase_durations() {
        let dir = tempfile::tempdir().unwrap();
        let (rec, _) = recorder(dir.path());
        let sid = SessionId::new();
        rec.start_session(sid.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        rec.create_checkpoint(&sid, NewCheckpoint::phase("goal_generation"))
            .await
            .unwrap();
        rec.complete_session(&sid, SessionOutcome::Completed, BTreeMap::new())
            .await
            .unwrap();

        let a = rec.analytics(&sid).await.unwrap().unwrap();
        assert_eq!(a.checkpoints_count, 3);
        assert_eq!(a.timeline.len(), 3);
        assert!(a.phase_durations.contains_key("goal_generation"));
        assert!(a.phase_durations.contains_key("session_complete"));
    }
}
