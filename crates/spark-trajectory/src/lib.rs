//! `spark-trajectory` - per-session checkpoint log.
//!
//! # Overview
//!
//! Every session owns one [`SessionTrajectory`]: an append-only, time-ordered
//! list of [`Checkpoint`]s plus aggregate resource usage and, once finished,
//! an outcome and quality metrics. The [`TrajectoryRecorder`] keeps active
//! trajectories in memory and rewrites `trajectory_{session_id}.json` through
//! the [`TrajectoryStore`] after every change.
//!
//! # Progress inference
//!
//! | Phase                | Progress |
//! |----------------------|----------|
//! | `session_start`      | 0        |
//! | `goal_generation`    | 20       |
//! | `code_generation`    | 50       |
//! | `validation`         | 70       |
//! | `testing`            | 85       |
//! | `discovery_creation` | 100      |
//! | anything else        | 50       |

pub mod error;
pub mod recorder;
pub mod store;
pub mod types;

pub use error::{Result, TrajectoryError};
pub use recorder::{CheckpointListener, TrajectoryRecorder};
pub use store::TrajectoryStore;
pub use types::{
    phase_progress, Checkpoint, NewCheckpoint, ResourceTotals, SessionAnalytics, SessionOutcome,
    SessionTrajectory, TimelineEntry,
};
