use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use spark_core::config::SchedulerConfig;
use spark_core::{JobId, SessionId, SparkConfig};
use spark_recovery::RecoveryEngine;
use spark_resources::ResourceMonitor;
use spark_sessions::{ExecutorOptions, Session, SessionExecutor, TaskFunction, TaskRegistry};
use spark_trajectory::{TrajectoryRecorder, TrajectoryStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SchedulerError};
use crate::store::JobStore;
use crate::types::{
    ExecutionRecord, JobDefinition, JobSpec, JobStatus, PlatformInfo, SchedulerStatus, TaskRef,
    TickReport,
};

/// How long `stop` waits for cancelled sessions to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The scheduler: owns the job store and drives due jobs into sessions.
///
/// Share as `Arc<Scheduler>`. Control methods may be called from any task
/// while the loop started by [`start`](Self::start) is running.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
    executor: SessionExecutor,
    monitor: ResourceMonitor,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Finished sessions reported by the executor.
    events: tokio::sync::Mutex<mpsc::Receiver<Session>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: JobStore,
        monitor: ResourceMonitor,
        recorder: Arc<TrajectoryRecorder>,
        recovery: Arc<RecoveryEngine>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let executor = SessionExecutor::new(
            recorder,
            recovery,
            ExecutorOptions::from(&config),
            Some(events_tx),
        );
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            store: Arc::new(store),
            registry: Arc::new(TaskRegistry::new()),
            executor,
            monitor,
            running: AtomicBool::new(false),
            shutdown,
            events: tokio::sync::Mutex::new(events_rx),
            loop_handle: Mutex::new(None),
        })
    }

    /// Wire every component from a loaded [`SparkConfig`]: procfs-backed
    /// resource monitor, trajectory files under `storage.sessions_dir`, and the
    /// job document at `storage.jobs_file`.
    pub fn from_config(config: &SparkConfig) -> Arc<Self> {
        let monitor = ResourceMonitor::from_config(&config.resources);
        let recorder = Arc::new(TrajectoryRecorder::new(
            TrajectoryStore::new(config.storage.sessions_path()),
            monitor.clone(),
            Duration::from_secs(config.checkpoint.interval_secs),
        ));
        let recovery = Arc::new(RecoveryEngine::from_config(
            Arc::clone(&recorder),
            &config.recovery,
        ));
        let store = JobStore::open(config.storage.jobs_path(), config.scheduler.use_local_time);
        Self::new(config.scheduler.clone(), store, monitor, recorder, recovery)
    }

    pub fn executor(&self) -> &SessionExecutor {
        &self.executor
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn recovery(&self) -> &Arc<RecoveryEngine> {
        self.executor.recovery()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Job management
    // -----------------------------------------------------------------------

    pub fn register_task_function(&self, name: &str, task: Arc<dyn TaskFunction>) -> Result<()> {
        self.registry.register(name, task)?;
        Ok(())
    }

    /// Validate and persist a new job. Its first `next_run` is computed from
    /// the current time.
    ///
    /// An unregistered task function is accepted with a warning: functions are
    /// registered in code at startup and may legitimately arrive after jobs.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub fn add_task(&self, spec: JobSpec) -> Result<JobId> {
        spec.schedule.validate()?;
        if spec.name.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("job name must not be empty".into()));
        }
        if !self.registry.contains(&spec.task_function) {
            warn!(task = %spec.task_function, "job references an unregistered task function");
        }

        let now = Utc::now();
        let next_run = crate::schedule::next_run_after(&spec.schedule, now, self.store.use_local_time());
        let job = JobDefinition {
            id: JobId::new(),
            name: spec.name,
            schedule: spec.schedule,
            budget: spec.budget,
            task: TaskRef {
                function: spec.task_function,
                args: spec.task_args,
            },
            status: if next_run.is_some() {
                JobStatus::Pending
            } else {
                JobStatus::Paused
            },
            next_run,
            last_run: None,
            run_count: 0,
            failure_count: 0,
            history: Vec::new(),
            tags: spec.tags,
            created_at: now,
            created_by: spec.created_by,
        };
        let id = job.id.clone();
        info!(job_id = %id, schedule = %job.schedule, next_run = ?job.next_run, "job added");
        self.store.add(job)?;
        Ok(id)
    }

    /// Delete a job and cancel its running sessions. Returns `false` if the
    /// job did not exist.
    #[instrument(skip(self))]
    pub fn remove_task(&self, id: &JobId) -> Result<bool> {
        // Store first: a dispatch racing with this either sees the job gone
        // when it reschedules, or has already registered its session here.
        let removed = self.store.remove(id)?.is_some();
        let stopped = self.executor.stop_job(id);
        if removed {
            info!(job_id = %id, cancelled_sessions = stopped, "job removed");
        }
        Ok(removed)
    }

    pub fn pause_task(&self, id: &JobId) -> Result<bool> {
        let paused = self.store.pause(id)?;
        if paused {
            info!(job_id = %id, "job paused");
        }
        Ok(paused)
    }

    /// Only a paused job can be resumed; its `next_run` is recomputed from now.
    pub fn resume_task(&self, id: &JobId) -> Result<bool> {
        let resumed = self.store.resume(id, Utc::now())?;
        if resumed {
            info!(job_id = %id, "job resumed");
        }
        Ok(resumed)
    }

    pub fn get_task(&self, id: &JobId) -> Option<JobDefinition> {
        self.store.get(id)
    }

    pub fn get_tasks(&self) -> Vec<JobDefinition> {
        self.store.list()
    }

    /// Run a job now, ignoring its schedule and the resource monitor. The
    /// job's concurrency limit still applies, and `next_run` is left alone.
    #[instrument(skip(self))]
    pub async fn trigger_task(&self, id: &JobId) -> Result<SessionId> {
        let job = self
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        let task = self.registry.get(&job.task.function).ok_or_else(|| {
            SchedulerError::TaskNotRegistered {
                name: job.task.function.clone(),
            }
        })?;

        let now = Utc::now();
        let session_id = self
            .executor
            .start(job.id.clone(), &job.name, job.budget.clone(), task, job.task.args.clone())
            .await?;
        let limit = self.config.history_limit;
        let recorded = self.store.update(id, |j| {
            j.last_run = Some(now);
            j.run_count += 1;
            push_started(j, &session_id, now, limit);
        })?;
        if recorded.is_none() {
            self.executor.stop(&session_id);
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, %session_id, "job triggered manually");
        Ok(session_id)
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let jobs = self.store.list();
        let count = |s: JobStatus| jobs.iter().filter(|j| j.status == s).count();
        SchedulerStatus {
            is_running: self.is_running(),
            total_tasks: jobs.len(),
            pending_tasks: count(JobStatus::Pending),
            paused_tasks: count(JobStatus::Paused),
            failed_tasks: count(JobStatus::Failed),
            active_sessions: self.executor.active_count(),
            platform_info: PlatformInfo {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                storage_path: self.store.path().display().to_string(),
                use_local_time: self.store.use_local_time(),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Spawn the polling loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return false;
        }
        self.shutdown.send_replace(false);
        let rx = self.shutdown.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(rx));
        *self.loop_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        true
    }

    /// Stop the loop, cancel every running session and wait for them to
    /// finish. Sessions still running after the grace period are abandoned.
    ///
    /// Also usable when the loop was never started, e.g. after a manual
    /// [`trigger_task`](Self::trigger_task).
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
            let handle = self
                .loop_handle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!("scheduler loop task failed: {e}");
                }
            }
        }

        let left = self.executor.shutdown(SHUTDOWN_GRACE).await;
        if left > 0 {
            warn!(sessions = left, "sessions still running after shutdown grace period");
        }
        self.drain_events();
        info!("scheduler stopped");
    }

    /// Main loop. Ticks every `poll_interval_secs` and records finished
    /// sessions as they arrive, until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_secs = self.config.poll_interval_secs,
            jobs = self.store.len(),
            "scheduler loop started"
        );
        // interval() panics on a zero period
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick_at(Utc::now()).await;
                    if report != TickReport::default() {
                        debug!(
                            dispatched = report.dispatched.len(),
                            deferred = report.deferred,
                            failed = report.failed,
                            skipped = report.skipped,
                            "scheduler tick"
                        );
                    }
                }
                Some(session) = async { self.events.lock().await.recv().await } => {
                    self.record_completion(&session);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over the store at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        self.drain_events();
        let mut report = TickReport::default();

        for job in self.store.list() {
            if !job.is_due(now) {
                continue;
            }
            if self.executor.running_for_job(&job.id) > 0 {
                debug!(job_id = %job.id, "job still running; not dispatching again");
                report.skipped += 1;
                continue;
            }
            let Some(task) = self.registry.get(&job.task.function) else {
                warn!(job_id = %job.id, task = %job.task.function, "task function not registered; skipping");
                report.skipped += 1;
                continue;
            };

            let snapshot = self.monitor.check(&job.budget).await;
            if !snapshot.within_limits {
                let next = now + chrono::Duration::minutes(self.config.resource_defer_minutes);
                info!(
                    job_id = %job.id,
                    violations = ?snapshot.violations,
                    next_run = %next,
                    "resources unavailable; deferring job"
                );
                let deferred = self.store.update(&job.id, |j| {
                    if j.status != JobStatus::Paused {
                        j.next_run = Some(next);
                    }
                });
                if let Err(e) = deferred {
                    error!(job_id = %job.id, "failed to persist deferral: {e}");
                }
                report.deferred += 1;
                continue;
            }

            match self.dispatch(&job, task, now).await {
                Ok(Some(session_id)) => report.dispatched.push(session_id),
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.id, "dispatch failed: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    // --- private helpers ---------------------------------------------------

    /// Claim the job, start a session and reschedule.
    ///
    /// `Ok(None)` means the job was paused or removed after the tick listed it.
    async fn dispatch(
        &self,
        job: &JobDefinition,
        task: Arc<dyn TaskFunction>,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionId>> {
        let claimed = self.store.update(&job.id, |j| {
            if j.status == JobStatus::Paused {
                return false;
            }
            j.status = JobStatus::Running;
            j.last_run = Some(now);
            j.run_count += 1;
            true
        })?;
        if claimed != Some(true) {
            return Ok(None);
        }
        info!(job_id = %job.id, name = %job.name, run = job.run_count + 1, "dispatching job");

        let started = self
            .executor
            .start(job.id.clone(), &job.name, job.budget.clone(), task, job.task.args.clone())
            .await;

        match started {
            Ok(session_id) => {
                if !self.settle_started(&job.id, &session_id, now)? {
                    return Ok(None);
                }
                Ok(Some(session_id))
            }
            Err(e) => {
                let step = self.config.backoff_step_minutes;
                let cap = self.config.max_backoff_minutes;
                self.store.update(&job.id, |j| {
                    j.failure_count += 1;
                    if j.status == JobStatus::Paused {
                        return;
                    }
                    let delay = (j.failure_count as i64).saturating_mul(step).min(cap);
                    j.status = JobStatus::Failed;
                    j.next_run = Some(now + chrono::Duration::minutes(delay));
                })?;
                Err(e.into())
            }
        }
    }

    /// Record the new session and compute the next run. Returns `false` and
    /// cancels the session when the job was removed while it was starting.
    fn settle_started(&self, job_id: &JobId, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool> {
        let limit = self.config.history_limit;
        let local = self.store.use_local_time();
        let settled = self.store.update(job_id, |j| {
            push_started(j, session_id, now, limit);
            if j.status == JobStatus::Paused {
                return;
            }
            match crate::schedule::next_run_after(&j.schedule, now, local) {
                Some(next) => {
                    j.status = JobStatus::Pending;
                    j.next_run = Some(next);
                }
                None => {
                    warn!(job_id = %j.id, "schedule exhausted; pausing job");
                    j.status = JobStatus::Paused;
                    j.next_run = None;
                }
            }
        })?;
        if settled.is_none() {
            warn!(%job_id, %session_id, "job removed during dispatch; cancelling session");
            self.executor.stop(session_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Record every finished session queued by the executor.
    fn drain_events(&self) {
        let Ok(mut events) = self.events.try_lock() else {
            return;
        };
        while let Ok(session) = events.try_recv() {
            self.record_completion(&session);
        }
    }

    fn record_completion(&self, session: &Session) {
        let limit = self.config.history_limit;
        let updated = self.store.update(&session.job_id, |j| {
            match j.history.iter_mut().rev().find(|r| r.session_id == session.id) {
                Some(record) => record.finish(session),
                None => {
                    let mut record = ExecutionRecord::started(session.id.clone(), session.start_time);
                    record.finish(session);
                    j.push_history(record, limit);
                }
            }
        });
        match updated {
            Ok(Some(())) => debug!(job_id = %session.job_id, session_id = %session.id, status = %session.status, "execution recorded"),
            Ok(None) => debug!(job_id = %session.job_id, "session finished for a removed job"),
            Err(e) => error!(job_id = %session.job_id, "failed to record execution: {e}"),
        }
    }
}

/// The completion event may already have recorded this session.
fn push_started(job: &mut JobDefinition, session_id: &SessionId, at: DateTime<Utc>, limit: usize) {
    if !job.history.iter().any(|r| &r.session_id == session_id) {
        job.push_history(ExecutionRecord::started(session_id.clone(), at), limit);
    }
}
