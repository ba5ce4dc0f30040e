use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use spark_core::JobId;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::schedule::next_run_after;
use crate::types::{JobDefinition, JobStatus};

/// Durable map of job id → [`JobDefinition`].
///
/// The whole map is one pretty-printed JSON document, rewritten after every
/// mutation while the lock is held, so the file always matches a state the
/// in-memory map actually passed through.
pub struct JobStore {
    path: PathBuf,
    use_local_time: bool,
    jobs: Mutex<BTreeMap<JobId, JobDefinition>>,
}

impl JobStore {
    /// Load `path` if it exists. Records that fail to deserialize are skipped
    /// with a warning; an unreadable document is moved aside and the store
    /// starts empty.
    pub fn open(path: impl Into<PathBuf>, use_local_time: bool) -> Self {
        let path = path.into();
        let jobs = load_jobs(&path);
        info!(path = %path.display(), jobs = jobs.len(), "job store loaded");
        Self {
            path,
            use_local_time,
            jobs: Mutex::new(jobs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn use_local_time(&self) -> bool {
        self.use_local_time
    }

    // -----------------------------------------------------------------------
    // Mutations (each persists before returning)
    // -----------------------------------------------------------------------

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn add(&self, job: JobDefinition) -> Result<()> {
        let mut jobs = self.lock();
        jobs.insert(job.id.clone(), job);
        self.persist(&jobs)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &JobId) -> Result<Option<JobDefinition>> {
        let mut jobs = self.lock();
        let removed = jobs.remove(id);
        if removed.is_some() {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    /// Stop dispatching the job. Clears `next_run` so a later resume can
    /// never pick up a stale slot.
    #[instrument(skip(self))]
    pub fn pause(&self, id: &JobId) -> Result<bool> {
        self.update(id, |job| {
            job.status = JobStatus::Paused;
            job.next_run = None;
        })
        .map(|r| r.is_some())
    }

    /// Paused → Pending with a freshly computed `next_run`. Returns `false` for
    /// unknown or non-paused jobs.
    #[instrument(skip(self))]
    pub fn resume(&self, id: &JobId, now: DateTime<Utc>) -> Result<bool> {
        let local = self.use_local_time;
        let resumed = self.update(id, |job| {
            if job.status != JobStatus::Paused {
                return false;
            }
            match next_run_after(&job.schedule, now, local) {
                Some(next) => {
                    job.status = JobStatus::Pending;
                    job.next_run = Some(next);
                    true
                }
                None => {
                    warn!(job_id = %job.id, "schedule has no future occurrence; job stays paused");
                    false
                }
            }
        })?;
        Ok(resumed.unwrap_or(false))
    }

    /// Apply `f` to the job and persist. `Ok(None)` if the job does not exist.
    /// The file is rewritten even if `f` changed nothing.
    pub fn update<R>(&self, id: &JobId, f: impl FnOnce(&mut JobDefinition) -> R) -> Result<Option<R>> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        let out = f(job);
        self.persist(&jobs)?;
        Ok(Some(out))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &JobId) -> Option<JobDefinition> {
        self.lock().get(id).cloned()
    }

    /// All jobs ordered by creation time.
    pub fn list(&self) -> Vec<JobDefinition> {
        let mut jobs: Vec<JobDefinition> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // --- private helpers ---------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, JobDefinition>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Write to a sibling temp file and rename over the document.
    fn persist(&self, jobs: &BTreeMap<JobId, JobDefinition>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(jobs)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(jobs = jobs.len(), "job store saved");
        Ok(())
    }
}

fn load_jobs(path: &Path) -> BTreeMap<JobId, JobDefinition> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            error!(path = %path.display(), "failed to read job store: {e}");
            return BTreeMap::new();
        }
    };

    let raw: BTreeMap<String, Value> = match serde_json::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            let aside = path.with_extension(format!("corrupt-{}", Utc::now().timestamp()));
            error!(
                path = %path.display(),
                moved_to = %aside.display(),
                "job store is not valid JSON: {e}"
            );
            if let Err(e) = std::fs::rename(path, &aside) {
                error!("could not move corrupt job store aside: {e}");
            }
            return BTreeMap::new();
        }
    };

    let mut jobs = BTreeMap::new();
    for (key, value) in raw {
        match serde_json::from_value::<JobDefinition>(value) {
            Ok(mut job) => {
                // Dispatch was interrupted by a restart.
                if job.status == JobStatus::Running {
                    warn!(job_id = %job.id, "job was mid-dispatch at shutdown; resetting to pending");
                    job.status = JobStatus::Pending;
                }
                jobs.insert(job.id.clone(), job);
            }
            Err(e) => warn!(job_id = %key, "skipping unreadable job record: {e}"),
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use crate::types::TaskRef;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use spark_resources::ResourceBudget;

    fn job(id: &str, schedule: Schedule) -> JobDefinition {
        JobDefinition {
            id: JobId::from(id),
            name: format!("job {id}"),
            schedule,
            budget: ResourceBudget {
                max_cpu_percent: 25.0,
                ..ResourceBudget::default()
            },
            task: TaskRef {
                function: "explore".into(),
                args: json!({ "depth": 2 }),
            },
            status: JobStatus::Pending,
            next_run: Some(Utc.with_ymd_and_hms(2024, 1, 10, 2, 0, 0).unwrap()),
            last_run: None,
            run_count: 3,
            failure_count: 1,
            history: Vec::new(),
            tags: vec!["t".into()],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            created_by: "tester".into(),
        }
    }

    #[test]
    fn persisted_jobs_reload_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        let original = job("a", Schedule::Weekly {
            day_of_week: 4,
            hour: 3,
            minute: 15,
        });
        {
            let store = JobStore::open(&path, false);
            store.add(original.clone()).unwrap();
        }
        let reopened = JobStore::open(&path, false);
        assert_eq!(reopened.get(&JobId::from("a")), Some(original));
    }

    #[test]
    fn bad_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        let good = serde_json::to_value(job("good", Schedule::Daily { hour: 1, minute: 0 })).unwrap();
        let doc = json!({
            "good": good,
            "bad": { "id": "bad", "schedule": { "kind": "fortnightly" } },
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let store = JobStore::open(&path, false);
        assert_eq!(store.len(), 1);
        assert!(store.get(&JobId::from("good")).is_some());
    }

    #[test]
    fn corrupt_document_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        std::fs::write(&path, "{ truncated").unwrap();

        let store = JobStore::open(&path, false);
        assert!(store.is_empty());
        assert!(!path.exists());
        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt-"));
        assert!(moved);
    }

    #[test]
    fn interrupted_dispatch_resets_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        let mut running = job("r", Schedule::Daily { hour: 1, minute: 0 });
        running.status = JobStatus::Running;
        JobStore::open(&path, false).add(running).unwrap();

        let store = JobStore::open(&path, false);
        assert_eq!(store.get(&JobId::from("r")).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn pause_then_resume_recomputes_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("scheduler.json"), false);
        let id = JobId::from("p");
        store
            .add(job("p", Schedule::Interval {
                interval_minutes: 30,
            }))
            .unwrap();
        let stale = store.get(&id).unwrap().next_run;

        assert!(store.pause(&id).unwrap());
        let paused = store.get(&id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.next_run, None);

        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert!(store.resume(&id, now).unwrap());
        let resumed = store.get(&id).unwrap();
        assert_eq!(resumed.status, JobStatus::Pending);
        assert_eq!(resumed.next_run, Some(now + Duration::minutes(30)));
        assert_ne!(resumed.next_run, stale);

        // resuming a job that is not paused is a no-op
        assert!(!store.resume(&id, now).unwrap());
        assert!(!store.resume(&JobId::from("missing"), now).unwrap());
    }

    #[test]
    fn remove_and_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path().join("scheduler.json"), false);
        let mut first = job("z", Schedule::Daily { hour: 1, minute: 0 });
        first.created_at = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        store.add(job("a", Schedule::Daily { hour: 1, minute: 0 })).unwrap();
        store.add(first).unwrap();

        let ids: Vec<String> = store.list().into_iter().map(|j| j.id.0).collect();
        assert_eq!(ids, ["z", "a"]);

        assert!(store.remove(&JobId::from("z")).unwrap().is_some());
        assert!(store.remove(&JobId::from("z")).unwrap().is_none());
        assert_eq!(JobStore::open(store.path(), false).len(), 1);
    }
}
