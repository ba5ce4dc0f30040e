use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduler cadence and backoff defaults
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RESOURCE_DEFER_MINUTES: i64 = 10;
pub const DEFAULT_BACKOFF_STEP_MINUTES: i64 = 10;
pub const DEFAULT_MAX_BACKOFF_MINUTES: i64 = 60;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_RETAINED_ERROR_SESSIONS: usize = 100;
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_WAIT_POLL_SECS: u64 = 30;
pub const DEFAULT_CPU_SAMPLE_WINDOW_MS: u64 = 1_000;

/// Top-level config (spark.toml + SPARK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparkConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the loop looks for due jobs.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay applied when a due job is refused by the resource monitor.
    #[serde(default = "default_resource_defer_minutes")]
    pub resource_defer_minutes: i64,
    /// Linear backoff step after a failed dispatch, multiplied by failure_count.
    #[serde(default = "default_backoff_step_minutes")]
    pub backoff_step_minutes: i64,
    #[serde(default = "default_max_backoff_minutes")]
    pub max_backoff_minutes: i64,
    /// Evaluate Daily/Weekly/Cron rules in the machine's local time zone.
    /// When false every rule is evaluated in UTC.
    #[serde(default = "bool_true")]
    pub use_local_time: bool,
    /// Execution records kept per job, and finished sessions kept by the executor.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Optional cap on Running sessions across all jobs. Unset means unbounded.
    #[serde(default)]
    pub max_global_sessions: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            resource_defer_minutes: DEFAULT_RESOURCE_DEFER_MINUTES,
            backoff_step_minutes: DEFAULT_BACKOFF_STEP_MINUTES,
            max_backoff_minutes: DEFAULT_MAX_BACKOFF_MINUTES,
            use_local_time: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_global_sessions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Job store file name, relative to `data_dir`.
    #[serde(default = "default_jobs_file")]
    pub jobs_file: String,
    /// Trajectory directory, relative to `data_dir`.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            jobs_file: default_jobs_file(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

impl StorageConfig {
    pub fn jobs_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.jobs_file)
    }

    pub fn sessions_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.sessions_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Window between the two /proc/stat reads used to derive CPU%.
    #[serde(default = "default_cpu_sample_window_ms")]
    pub cpu_sample_window_ms: u64,
    /// Poll cadence of `ResourceMonitor::wait_for`.
    #[serde(default = "default_wait_poll_secs")]
    pub wait_poll_secs: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            cpu_sample_window_ms: DEFAULT_CPU_SAMPLE_WINDOW_MS,
            wait_poll_secs: DEFAULT_WAIT_POLL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Per-session resource sampling cadence.
    #[serde(default = "default_checkpoint_interval_secs")]
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Install the built-in network / rate-limit / resource / generation / auth
    /// strategies. Disable to start from an empty table and add custom ones.
    #[serde(default = "bool_true")]
    pub default_strategies: bool,
    /// Upper bound on a single backoff sleep. Unset means no cap.
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
    /// Finished sessions whose error records stay queryable.
    #[serde(default = "default_retained_sessions")]
    pub retained_sessions: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            default_strategies: true,
            max_delay_secs: None,
            retained_sessions: DEFAULT_RETAINED_ERROR_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when RUST_LOG is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_resource_defer_minutes() -> i64 {
    DEFAULT_RESOURCE_DEFER_MINUTES
}
fn default_backoff_step_minutes() -> i64 {
    DEFAULT_BACKOFF_STEP_MINUTES
}
fn default_max_backoff_minutes() -> i64 {
    DEFAULT_MAX_BACKOFF_MINUTES
}
fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_retained_sessions() -> usize {
    DEFAULT_RETAINED_ERROR_SESSIONS
}
fn default_cpu_sample_window_ms() -> u64 {
    DEFAULT_CPU_SAMPLE_WINDOW_MS
}
fn default_wait_poll_secs() -> u64 {
    DEFAULT_WAIT_POLL_SECS
}
fn default_checkpoint_interval_secs() -> u64 {
    DEFAULT_CHECKPOINT_INTERVAL_SECS
}
fn default_jobs_file() -> String {
    "scheduler.json".to_string()
}
fn default_sessions_dir() -> String {
    "sessions".to_string()
}
fn default_log_filter() -> String {
    "sparkd=info,spark_scheduler=info,spark_sessions=info,spark_recovery=info,spark_trajectory=info"
        .to_string()
}
fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.spark", home)
}

impl SparkConfig {
    /// Load config from a TOML file with SPARK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.spark/spark.toml
    ///
    /// Nested keys use a double underscore, e.g.
    /// `SPARK_SCHEDULER__POLL_INTERVAL_SECS=5`. A missing file is not an error.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::SparkError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(SparkConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SPARK_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.spark/spark.toml", home)
}
