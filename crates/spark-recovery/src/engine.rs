use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use spark_core::SessionId;
use spark_trajectory::{NewCheckpoint, SessionOutcome, TrajectoryError, TrajectoryRecorder};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::classifier::{Classifier, RecoveryStrategy};
use crate::types::{
    ErrorKind, ErrorRecord, ErrorSeverity, ErrorStatistics, RecoveryAction, RecoveryDecision,
    TaskError, TerminationKind,
};

/// Releases resources held on behalf of a session when it is terminated.
#[async_trait]
pub trait CleanupHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Critical handlers also run during an emergency stop.
    fn critical(&self) -> bool {
        false
    }

    async fn cleanup(&self, session_id: &SessionId) -> anyhow::Result<()>;
}

/// Notified after a session has been terminated by the recovery engine.
pub trait TerminationCallback: Send + Sync {
    fn on_terminated(&self, session_id: &SessionId, kind: TerminationKind);
}

impl<F> TerminationCallback for F
where
    F: Fn(&SessionId, TerminationKind) + Send + Sync,
{
    fn on_terminated(&self, session_id: &SessionId, kind: TerminationKind) {
        self(session_id, kind)
    }
}

#[derive(Default)]
struct SessionRecovery {
    records: Vec<ErrorRecord>,
    fallback_attempts: u32,
}

/// Policy parameters copied out of the matched strategy so no lock is held
/// while recovery actions run.
struct Plan {
    name: Option<String>,
    severity: ErrorSeverity,
    max_retries: u32,
    actions: Vec<RecoveryAction>,
    strategy: Option<RecoveryStrategy>,
}

impl Plan {
    fn from_strategy(strategy: Option<&RecoveryStrategy>) -> Self {
        match strategy {
            Some(s) => Self {
                name: Some(s.name.clone()),
                severity: s.severity,
                max_retries: s.max_retries,
                actions: s.actions.clone(),
                strategy: Some(s.clone()),
            },
            None => Self {
                name: None,
                severity: ErrorSeverity::Low,
                max_retries: 0,
                actions: vec![RecoveryAction::SkipAndContinue],
                strategy: None,
            },
        }
    }
}

/// Classifies task failures and drives each session's escalation state.
///
/// Share as `Arc<RecoveryEngine>`; all methods take `&self`.
pub struct RecoveryEngine {
    classifier: RwLock<Classifier>,
    sessions: Mutex<HashMap<SessionId, SessionRecovery>>,
    cleanup_handlers: RwLock<Vec<Arc<dyn CleanupHandler>>>,
    callbacks: RwLock<Vec<Arc<dyn TerminationCallback>>>,
    /// Finished sessions, oldest first. Their records are evicted past
    /// `retained_sessions`.
    finished: Mutex<VecDeque<SessionId>>,
    retained_sessions: usize,
    recorder: Arc<TrajectoryRecorder>,
    max_delay: Option<Duration>,
}

impl RecoveryEngine {
    pub fn new(recorder: Arc<TrajectoryRecorder>, classifier: Classifier) -> Self {
        Self {
            classifier: RwLock::new(classifier),
            sessions: Mutex::new(HashMap::new()),
            cleanup_handlers: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
            finished: Mutex::new(VecDeque::new()),
            retained_sessions: spark_core::config::DEFAULT_RETAINED_ERROR_SESSIONS,
            recorder,
            max_delay: None,
        }
    }

    /// Engine configured from `[recovery]`.
    pub fn from_config(
        recorder: Arc<TrajectoryRecorder>,
        config: &spark_core::config::RecoveryConfig,
    ) -> Self {
        let classifier = if config.default_strategies {
            Classifier::with_defaults()
        } else {
            Classifier::default()
        };
        let mut engine = Self::new(recorder, classifier);
        engine.max_delay = config.max_delay_secs.map(Duration::from_secs);
        engine.retained_sessions = config.retained_sessions;
        engine
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_retained_sessions(mut self, retained: usize) -> Self {
        self.retained_sessions = retained;
        self
    }

    pub fn recorder(&self) -> &Arc<TrajectoryRecorder> {
        &self.recorder
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn add_recovery_strategy(&self, strategy: RecoveryStrategy) {
        info!(strategy = %strategy.name, "recovery strategy added");
        write_lock(&self.classifier).push(strategy);
    }

    pub fn add_cleanup_handler(&self, handler: Arc<dyn CleanupHandler>) {
        debug!(handler = handler.name(), "cleanup handler registered");
        write_lock(&self.cleanup_handlers).push(handler);
    }

    pub fn add_termination_callback(&self, callback: Arc<dyn TerminationCallback>) {
        write_lock(&self.callbacks).push(callback);
    }

    // -----------------------------------------------------------------------
    // Error handling
    // -----------------------------------------------------------------------

    /// Classify `error`, record it, write an error checkpoint and carry out
    /// the chosen action. Backoff delays elapse before this returns.
    #[instrument(skip(self, error), fields(kind = %error.kind))]
    pub async fn handle_error(
        &self,
        session_id: &SessionId,
        phase: &str,
        error: &TaskError,
    ) -> RecoveryDecision {
        let plan = {
            let classifier = read_lock(&self.classifier);
            Plan::from_strategy(classifier.classify(error))
        };

        let (record, delay) = self.escalate(session_id, phase, error, &plan);
        error!(
            error_id = %record.id,
            strategy = record.strategy.as_deref().unwrap_or("unclassified"),
            severity = record.severity.as_str(),
            action = %record.action,
            retry_count = record.retry_count,
            "session error: {}",
            error.message
        );

        self.checkpoint(
            session_id,
            NewCheckpoint::phase(format!("{phase}_error_handling"))
                .state(json!({
                    "error_id": record.id,
                    "error_kind": record.kind,
                    "error_message": record.message,
                    "severity": record.severity,
                    "recovery_action": record.action,
                    "retry_count": record.retry_count,
                }))
                .error(record.message.clone()),
        )
        .await;

        match record.action {
            RecoveryAction::Retry => RecoveryDecision::Retry {
                attempt: record.retry_count,
            },
            RecoveryAction::RetryWithBackoff => {
                if let Some(delay) = delay {
                    info!(
                        attempt = record.retry_count,
                        delay_secs = delay.as_secs_f64(),
                        "retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                RecoveryDecision::Retry {
                    attempt: record.retry_count,
                }
            }
            RecoveryAction::FallbackApproach => {
                let approach = self.next_fallback(session_id);
                self.checkpoint(
                    session_id,
                    NewCheckpoint::phase("fallback_approach").state(json!({
                        "fallback_attempt": approach,
                        "reason": record.message,
                    })),
                )
                .await;
                RecoveryDecision::Fallback { approach }
            }
            RecoveryAction::SkipAndContinue => {
                self.checkpoint(
                    session_id,
                    NewCheckpoint::phase("skip_operation").state(json!({
                        "skipped_phase": record.phase,
                        "reason": record.message,
                    })),
                )
                .await;
                RecoveryDecision::Skip
            }
            RecoveryAction::GracefulTerminate => {
                self.graceful_terminate(session_id, &record).await;
                RecoveryDecision::Terminated(TerminationKind::Graceful)
            }
            RecoveryAction::EmergencyStop => {
                self.emergency_stop(session_id, &record.message).await;
                RecoveryDecision::Terminated(TerminationKind::Emergency)
            }
        }
    }

    /// Operator-forced shutdown of a session: critical cleanup only, trajectory
    /// finalized as `emergency_stopped`.
    #[instrument(skip(self))]
    pub async fn force_terminate_session(&self, session_id: &SessionId, reason: &str) {
        warn!(reason, "force terminating session");
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            timestamp: Utc::now(),
            phase: "forced_termination".to_string(),
            kind: ErrorKind::Cancelled,
            message: reason.to_string(),
            severity: ErrorSeverity::Critical,
            strategy: None,
            action: RecoveryAction::EmergencyStop,
            retry_count: 0,
            total_retries: 0,
            resolved: true,
            occurrences: 1,
            action_index: 0,
        };
        lock(&self.sessions)
            .entry(session_id.clone())
            .or_default()
            .records
            .push(record);
        self.emergency_stop(session_id, reason).await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_session_errors(&self, session_id: &SessionId) -> Vec<ErrorRecord> {
        lock(&self.sessions)
            .get(session_id)
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    pub fn get_error_statistics(&self, session_id: &SessionId) -> ErrorStatistics {
        let sessions = lock(&self.sessions);
        match sessions.get(session_id) {
            Some(s) => ErrorStatistics::from_records(&s.records),
            None => ErrorStatistics::default(),
        }
    }

    /// Drop all recovery state for a session.
    pub fn clear_session_errors(&self, session_id: &SessionId) {
        lock(&self.sessions).remove(session_id);
        lock(&self.finished).retain(|id| id != session_id);
    }

    /// Mark a session as finished. Its records stay queryable until
    /// `retained_sessions` newer sessions have finished.
    pub fn finish_session(&self, session_id: &SessionId) {
        let evicted: Vec<SessionId> = {
            let mut finished = lock(&self.finished);
            if !finished.contains(session_id) {
                finished.push_back(session_id.clone());
            }
            let excess = finished.len().saturating_sub(self.retained_sessions);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut sessions = lock(&self.sessions);
        for id in &evicted {
            sessions.remove(id);
        }
        debug!(evicted = evicted.len(), "evicted error records of old sessions");
    }

    // --- private helpers ---------------------------------------------------

    /// Find or open the record for this failure and advance it through the
    /// strategy's action list. Returns a snapshot plus any backoff delay.
    fn escalate(
        &self,
        session_id: &SessionId,
        phase: &str,
        error: &TaskError,
        plan: &Plan,
    ) -> (ErrorRecord, Option<Duration>) {
        let mut sessions = lock(&self.sessions);
        let state = sessions.entry(session_id.clone()).or_default();

        let prior_critical = state
            .records
            .iter()
            .any(|r| r.severity == ErrorSeverity::Critical);

        let existing = state
            .records
            .iter()
            .position(|r| !r.resolved && r.phase == phase && r.strategy == plan.name);
        let idx = match existing {
            Some(i) => {
                let r = &mut state.records[i];
                r.occurrences += 1;
                r.message = error.message.clone();
                r.kind = error.kind;
                r.timestamp = Utc::now();
                i
            }
            None => {
                state.records.push(ErrorRecord {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    timestamp: Utc::now(),
                    phase: phase.to_string(),
                    kind: error.kind,
                    message: error.message.clone(),
                    severity: plan.severity,
                    strategy: plan.name.clone(),
                    action: plan
                        .actions
                        .first()
                        .copied()
                        .unwrap_or(RecoveryAction::GracefulTerminate),
                    retry_count: 0,
                    total_retries: 0,
                    resolved: false,
                    occurrences: 1,
                    action_index: 0,
                });
                state.records.len() - 1
            }
        };
        let record = &mut state.records[idx];

        let mut delay = None;
        let action = loop {
            let action = match plan.actions.get(record.action_index) {
                Some(a) => *a,
                None => break RecoveryAction::GracefulTerminate,
            };
            if !action.is_repeatable() {
                break action;
            }
            if record.retry_count >= plan.max_retries {
                debug!(
                    from = %action,
                    retries = record.retry_count,
                    "retry budget exhausted, escalating"
                );
                record.action_index += 1;
                record.retry_count = 0;
                continue;
            }
            if action == RecoveryAction::RetryWithBackoff {
                if let Some(strategy) = &plan.strategy {
                    let d = strategy.backoff_delay(record.retry_count);
                    delay = Some(match self.max_delay {
                        Some(max) => d.min(max),
                        None => d,
                    });
                }
            }
            record.retry_count += 1;
            record.total_retries += 1;
            break action;
        };

        // A second critical failure in the same session means cleanup is not
        // going to help; stop without running non-critical handlers.
        let action = if plan.severity == ErrorSeverity::Critical && prior_critical {
            warn!("repeated critical error, escalating to emergency stop");
            RecoveryAction::EmergencyStop
        } else {
            action
        };

        record.action = action;
        if matches!(
            action,
            RecoveryAction::SkipAndContinue
                | RecoveryAction::GracefulTerminate
                | RecoveryAction::EmergencyStop
        ) {
            record.resolved = true;
        }
        (record.clone(), delay)
    }

    fn next_fallback(&self, session_id: &SessionId) -> u32 {
        let mut sessions = lock(&self.sessions);
        let state = sessions.entry(session_id.clone()).or_default();
        state.fallback_attempts += 1;
        state.fallback_attempts
    }

    async fn graceful_terminate(&self, session_id: &SessionId, record: &ErrorRecord) {
        warn!(%session_id, "initiating graceful termination");
        self.checkpoint(
            session_id,
            NewCheckpoint::phase("graceful_termination")
                .progress(100.0)
                .state(json!({
                    "termination_reason": record.message,
                    "error_severity": record.severity,
                })),
        )
        .await;
        self.run_cleanup(session_id, false).await;
        self.finish(session_id, SessionOutcome::TerminatedGracefully)
            .await;
        self.notify(session_id, TerminationKind::Graceful);
    }

    async fn emergency_stop(&self, session_id: &SessionId, reason: &str) {
        error!(%session_id, reason, "emergency stop");
        self.checkpoint(
            session_id,
            NewCheckpoint::phase("emergency_stop")
                .progress(100.0)
                .state(json!({ "reason": reason })),
        )
        .await;
        self.run_cleanup(session_id, true).await;
        self.finish(session_id, SessionOutcome::EmergencyStopped)
            .await;
        self.notify(session_id, TerminationKind::Emergency);
    }

    /// Best-effort: a failing handler is logged and the rest still run.
    async fn run_cleanup(&self, session_id: &SessionId, emergency: bool) {
        let handlers: Vec<Arc<dyn CleanupHandler>> = read_lock(&self.cleanup_handlers)
            .iter()
            .filter(|h| !emergency || h.critical())
            .cloned()
            .collect();
        for handler in handlers {
            match handler.cleanup(session_id).await {
                Ok(()) => debug!(handler = handler.name(), "cleanup handler completed"),
                Err(e) if emergency => error!(
                    handler = handler.name(),
                    "cleanup handler failed during emergency stop: {e:#}"
                ),
                Err(e) => error!(handler = handler.name(), "cleanup handler failed: {e:#}"),
            }
        }
    }

    async fn finish(&self, session_id: &SessionId, outcome: SessionOutcome) {
        match self
            .recorder
            .complete_session(session_id, outcome, BTreeMap::new())
            .await
        {
            Ok(_) => {}
            Err(TrajectoryError::NotActive { .. }) => {
                debug!(%session_id, "trajectory already finalized")
            }
            Err(e) => error!(%session_id, "failed to finalize trajectory: {e}"),
        }
    }

    fn notify(&self, session_id: &SessionId, kind: TerminationKind) {
        let callbacks: Vec<Arc<dyn TerminationCallback>> = read_lock(&self.callbacks).clone();
        for callback in callbacks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                callback.on_terminated(session_id, kind)
            }));
            if outcome.is_err() {
                error!(%session_id, "termination callback panicked");
            }
        }
    }

    /// Checkpoint failures are logged; recovery must proceed regardless.
    async fn checkpoint(&self, session_id: &SessionId, input: NewCheckpoint) {
        match self.recorder.create_checkpoint(session_id, input).await {
            Ok(_) => {}
            Err(TrajectoryError::NotActive { .. }) => {
                debug!(%session_id, "no active trajectory for recovery checkpoint")
            }
            Err(e) => warn!(%session_id, "recovery checkpoint failed: {e}"),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use spark_core::JobId;
    use spark_resources::{FixedProbe, ResourceMonitor};
    use spark_trajectory::TrajectoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        engine: RecoveryEngine,
        session: SessionId,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(TrajectoryRecorder::new(
            TrajectoryStore::new(dir.path()),
            ResourceMonitor::new(Arc::new(FixedProbe::idle())),
            Duration::from_secs(30),
        ));
        let session = SessionId::new();
        recorder
            .start_session(session.clone(), JobId::from("j"), "job", Value::Null)
            .await
            .unwrap();
        Harness {
            engine: RecoveryEngine::new(recorder, Classifier::with_defaults()),
            session,
            _dir: dir,
        }
    }

    struct CountingCleanup {
        name: &'static str,
        critical: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl CountingCleanup {
        fn new(name: &'static str, critical: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                critical,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CleanupHandler for CountingCleanup {
        fn name(&self) -> &str {
            self.name
        }
        fn critical(&self) -> bool {
            self.critical
        }
        async fn cleanup(&self, _session_id: &SessionId) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("cleanup exploded");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_back_off_then_fall_back() {
        let h = harness().await;
        let err = TaskError::new(ErrorKind::Network, "connection reset");

        let started = tokio::time::Instant::now();
        for attempt in 1..=3 {
            let d = h.engine.handle_error(&h.session, "code_generation", &err).await;
            assert_eq!(d, RecoveryDecision::Retry { attempt });
        }
        // 5 + 10 + 20 seconds of backoff
        assert!(started.elapsed() >= Duration::from_secs(35));

        let d = h.engine.handle_error(&h.session, "code_generation", &err).await;
        assert_eq!(d, RecoveryDecision::Fallback { approach: 1 });

        let records = h.engine.get_session_errors(&h.session);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, RecoveryAction::FallbackApproach);
        assert_eq!(records[0].retry_count, 1);
        assert_eq!(records[0].occurrences, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_action_list_terminates_gracefully() {
        let h = harness().await;
        let err = TaskError::new(ErrorKind::Network, "connection reset");
        let mut last = RecoveryDecision::Skip;
        for _ in 0..7 {
            last = h.engine.handle_error(&h.session, "testing", &err).await;
        }
        assert_eq!(last, RecoveryDecision::Terminated(TerminationKind::Graceful));

        let t = h
            .engine
            .recorder()
            .get_trajectory(&h.session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.outcome, Some(SessionOutcome::TerminatedGracefully));
        assert_eq!(t.checkpoints.last().unwrap().progress, 100.0);
    }

    #[tokio::test]
    async fn generation_failure_falls_back_then_skips() {
        let h = harness().await;
        let err = TaskError::new(ErrorKind::Generation, "generation failed");
        assert_eq!(
            h.engine.handle_error(&h.session, "code_generation", &err).await,
            RecoveryDecision::Fallback { approach: 1 }
        );
        assert_eq!(
            h.engine.handle_error(&h.session, "code_generation", &err).await,
            RecoveryDecision::Fallback { approach: 2 }
        );
        assert_eq!(
            h.engine.handle_error(&h.session, "code_generation", &err).await,
            RecoveryDecision::Skip
        );
        let records = h.engine.get_session_errors(&h.session);
        assert!(records[0].resolved);
    }

    #[tokio::test]
    async fn unmatched_error_is_skipped_but_recorded() {
        let h = harness().await;
        let d = h
            .engine
            .handle_error(&h.session, "testing", &TaskError::unclassified("weird"))
            .await;
        assert_eq!(d, RecoveryDecision::Skip);

        let records = h.engine.get_session_errors(&h.session);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity, ErrorSeverity::Low);
        assert!(records[0].strategy.is_none());

        let t = h
            .engine
            .recorder()
            .get_trajectory(&h.session)
            .await
            .unwrap()
            .unwrap();
        let phases: Vec<&str> = t.checkpoints.iter().map(|c| c.phase.as_str()).collect();
        assert!(phases.contains(&"testing_error_handling"));
        assert!(phases.contains(&"skip_operation"));
    }

    #[tokio::test]
    async fn graceful_termination_runs_all_cleanup_and_notifies() {
        let h = harness().await;
        let ok = CountingCleanup::new("ok", false, false);
        let broken = CountingCleanup::new("broken", false, true);
        h.engine.add_cleanup_handler(broken.clone());
        h.engine.add_cleanup_handler(ok.clone());

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        h.engine
            .add_termination_callback(Arc::new(move |_: &SessionId, kind: TerminationKind| {
                sink.lock().unwrap().push(kind);
            }));

        let d = h
            .engine
            .handle_error(&h.session, "testing", &TaskError::new(ErrorKind::Auth, "401"))
            .await;
        assert_eq!(d, RecoveryDecision::Terminated(TerminationKind::Graceful));
        // failing handler does not prevent the next one
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*kinds.lock().unwrap(), vec![TerminationKind::Graceful]);
        assert!(!h.engine.recorder().is_active(&h.session));
    }

    #[tokio::test]
    async fn repeated_critical_error_becomes_emergency_stop() {
        let h = harness().await;
        let critical = CountingCleanup::new("critical", true, false);
        let regular = CountingCleanup::new("regular", false, false);
        h.engine.add_cleanup_handler(critical.clone());
        h.engine.add_cleanup_handler(regular.clone());

        let oom = TaskError::new(ErrorKind::ResourceExhausted, "out of memory");
        let first = h.engine.handle_error(&h.session, "testing", &oom).await;
        assert_eq!(first, RecoveryDecision::Terminated(TerminationKind::Graceful));

        let second = h.engine.handle_error(&h.session, "validation", &oom).await;
        assert_eq!(second, RecoveryDecision::Terminated(TerminationKind::Emergency));
        // graceful ran both; emergency ran only the critical one
        assert_eq!(critical.calls.load(Ordering::SeqCst), 2);
        assert_eq!(regular.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_terminate_finalizes_as_emergency() {
        let h = harness().await;
        let regular = CountingCleanup::new("regular", false, false);
        h.engine.add_cleanup_handler(regular.clone());

        h.engine
            .force_terminate_session(&h.session, "operator request")
            .await;

        assert_eq!(regular.calls.load(Ordering::SeqCst), 0);
        let t = h
            .engine
            .recorder()
            .get_trajectory(&h.session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.outcome, Some(SessionOutcome::EmergencyStopped));
        let stats = h.engine.get_error_statistics(&h.session);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.by_severity["critical"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_and_clear() {
        let h = harness().await;
        h.engine
            .handle_error(&h.session, "testing", &TaskError::unclassified("weird"))
            .await;
        h.engine
            .handle_error(
                &h.session,
                "goal_generation",
                &TaskError::new(ErrorKind::Timeout, "deadline"),
            )
            .await;

        let stats = h.engine.get_error_statistics(&h.session);
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.resolved_errors, 1);
        assert_eq!(stats.by_phase["goal_generation"], 1);
        assert_eq!(stats.by_kind["timeout"], 1);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.average_retries, 0.5);

        h.engine.clear_session_errors(&h.session);
        assert_eq!(h.engine.get_error_statistics(&h.session).total_errors, 0);
    }

    #[tokio::test]
    async fn finished_sessions_keep_records_until_evicted() {
        let h = harness().await;
        let engine = h.engine.with_retained_sessions(2);
        let sessions: Vec<SessionId> = (0..3).map(|_| SessionId::new()).collect();
        for sid in &sessions {
            engine
                .handle_error(sid, "testing", &TaskError::unclassified("boom"))
                .await;
            engine.finish_session(sid);
        }

        assert_eq!(engine.get_error_statistics(&sessions[0]).total_errors, 0);
        assert_eq!(engine.get_error_statistics(&sessions[1]).total_errors, 1);
        assert_eq!(engine.get_session_errors(&sessions[2]).len(), 1);

        // finishing twice does not take a second slot
        engine.finish_session(&sessions[2]);
        assert_eq!(engine.get_error_statistics(&sessions[1]).total_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_delay_caps_backoff() {
        let h = harness().await;
        let engine = h.engine.with_max_delay(Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        engine
            .handle_error(
                &h.session,
                "testing",
                &TaskError::new(ErrorKind::RateLimited, "429"),
            )
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
