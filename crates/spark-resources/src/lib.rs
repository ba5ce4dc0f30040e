//! `spark-resources` - machine resource budgets and admission checks.
//!
//! # Overview
//!
//! A [`ResourceBudget`] lists the thresholds a job must respect. The
//! [`ResourceMonitor`] samples live metrics through a [`MetricsProbe`] and
//! returns a [`ResourceSnapshot`] saying whether the budget is currently met.
//!
//! | Metric       | Source (Linux)                      | When unavailable |
//! |--------------|-------------------------------------|------------------|
//! | CPU %        | two `/proc/stat` reads ~1 s apart   | 0                |
//! | Memory MB    | `/proc/meminfo` total − available   | 0                |
//! | Battery %    | `/sys/class/power_supply/BAT*`      | 100              |
//! | Temperature  | `/sys/class/thermal/thermal_zone*`  | 0                |
//!
//! A zero-valued limit disables the corresponding check.

pub mod monitor;
pub mod probe;
pub mod types;

pub use monitor::ResourceMonitor;
pub use probe::{CpuBaseline, FixedProbe, MetricsProbe, SystemMetrics, SystemProbe};
pub use types::{ProcessUsage, ResourceBudget, ResourceSnapshot};
