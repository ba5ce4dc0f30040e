//! `spark-core` - configuration, shared error type and identifiers used by
//! every other `spark-*` crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::SparkConfig;
pub use error::{Result, SparkError};
pub use types::{JobId, SessionId};
