//! `spark-sessions` - task registry and the Session Executor.
//!
//! # Overview
//!
//! A job names a task function registered in the [`TaskRegistry`]. The
//! [`SessionExecutor`] runs it as a [`Session`]: one Tokio task per session,
//! bounded by the job's `max_concurrent_sessions` and `max_duration_minutes`,
//! with every checkpoint going to the trajectory recorder and every failure
//! to the recovery engine.
//!
//! # Terminal states
//!
//! | Ending                          | Status      | Trajectory outcome      |
//! |---------------------------------|-------------|-------------------------|
//! | task returned `Ok`              | `Completed` | `completed`             |
//! | recovery chose skip             | `Failed`    | `skipped`               |
//! | graceful termination            | `Failed`    | `terminated_gracefully` |
//! | emergency stop / force terminate| `Failed`    | `emergency_stopped`     |
//! | deadline reached                | `TimedOut`  | `timed_out`             |
//! | `stop` / scheduler shutdown     | `Cancelled` | `cancelled`             |

pub mod context;
pub mod error;
pub mod executor;
pub mod registry;
pub mod types;

pub use context::TaskContext;
pub use error::{Result, SessionError};
pub use executor::{ExecutorOptions, SessionExecutor};
pub use registry::{TaskFunction, TaskRegistry};
pub use types::{Session, SessionStatus};
