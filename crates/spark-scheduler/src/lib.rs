//! `spark-scheduler` - recurring exploration jobs with JSON persistence.
//!
//! # Overview
//!
//! Jobs live in a [`JobStore`], one JSON document rewritten on every change.
//! The [`Scheduler`] polls the store, asks the resource monitor whether a due
//! job may run now, and hands admitted jobs to the session executor. A busy
//! machine defers the job; a rejected dispatch backs off linearly.
//!
//! # Schedule kinds
//!
//! | Kind       | Next run                                                   |
//! |------------|------------------------------------------------------------|
//! | `daily`    | HH:MM today if still ahead, else tomorrow                  |
//! | `weekdays` | next Monday–Friday at HH:MM                                |
//! | `weekends` | next Saturday or Sunday at HH:MM                           |
//! | `weekly`   | HH:MM on `day_of_week` (0 = Monday), never today           |
//! | `interval` | now + N minutes                                            |
//! | `cron`     | next match of a 5- or 6-field expression                   |
//!
//! Wall-clock kinds are evaluated in local time unless
//! `scheduler.use_local_time` is off, in which case UTC is used.

pub mod error;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod types;

pub use error::{Result, SchedulerError};
pub use schedule::{compute_next_run, next_run_after, Schedule};
pub use scheduler::Scheduler;
pub use store::JobStore;
pub use types::{
    ExecutionRecord, JobDefinition, JobSpec, JobStatus, PlatformInfo, SchedulerStatus, TaskRef,
    TickReport,
};
