use std::path::{Path, PathBuf};

use spark_core::SessionId;
use tracing::debug;

use crate::error::Result;
use crate::types::SessionTrajectory;

/// One pretty-printed JSON document per session under `dir`.
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    dir: PathBuf,
}

impl TrajectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("trajectory_{}.json", session_id))
    }

    /// Rewrite the whole document. Written to a sibling temp file and renamed
    /// so a crash never leaves a truncated trajectory behind.
    pub fn save(&self, trajectory: &SessionTrajectory) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&trajectory.session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(trajectory)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(
            session_id = %trajectory.session_id,
            checkpoints = trajectory.checkpoints.len(),
            "trajectory saved"
        );
        Ok(())
    }

    /// `Ok(None)` when no document exists for the session.
    pub fn load(&self, session_id: &SessionId) -> Result<Option<SessionTrajectory>> {
        let path = self.path_for(session_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_core::JobId;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path().join("sessions"));
        let trajectory = SessionTrajectory::new(SessionId::from("s1"), JobId::from("j1"), "nightly");

        store.save(&trajectory).unwrap();
        assert!(dir.path().join("sessions/trajectory_s1.json").exists());

        let loaded = store.load(&SessionId::from("s1")).unwrap().unwrap();
        assert_eq!(loaded, trajectory);
    }

    #[test]
    fn missing_trajectory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path());
        assert!(store.load(&SessionId::from("nope")).unwrap().is_none());
    }

    #[test]
    fn corrupt_trajectory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrajectoryStore::new(dir.path());
        std::fs::write(store.path_for(&SessionId::from("bad")), "{not json").unwrap();
        assert!(store.load(&SessionId::from("bad")).is_err());
    }
}
