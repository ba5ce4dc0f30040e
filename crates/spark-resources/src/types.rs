use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Thresholds a job must respect to be admitted, plus its execution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,
    /// System-wide used memory ceiling.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Hard wall-clock deadline of one session.
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: u64,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    /// 0 = ignore battery level.
    #[serde(default = "default_min_battery_percent")]
    pub min_battery_percent: f64,
    /// 0 = ignore temperature.
    #[serde(default = "default_max_temperature_celsius")]
    pub max_temperature_celsius: f64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            max_cpu_percent: default_max_cpu_percent(),
            max_memory_mb: default_max_memory_mb(),
            max_duration_minutes: default_max_duration_minutes(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            min_battery_percent: default_min_battery_percent(),
            max_temperature_celsius: default_max_temperature_celsius(),
        }
    }
}

impl ResourceBudget {
    /// A budget with every admission check disabled. Duration and concurrency
    /// keep their defaults since they bound execution, not admission.
    pub fn unlimited() -> Self {
        Self {
            max_cpu_percent: 0.0,
            max_memory_mb: 0,
            min_battery_percent: 0.0,
            max_temperature_celsius: 0.0,
            ..Self::default()
        }
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_minutes.saturating_mul(60))
    }
}

fn default_max_cpu_percent() -> f64 {
    50.0
}
fn default_max_memory_mb() -> u64 {
    1024
}
fn default_max_duration_minutes() -> u64 {
    120
}
fn default_max_concurrent_sessions() -> usize {
    1
}
fn default_min_battery_percent() -> f64 {
    30.0
}
fn default_max_temperature_celsius() -> f64 {
    70.0
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_mb: u64,
    pub battery_percent: f64,
    pub temperature_celsius: f64,
    /// Human-readable description of every violated limit.
    pub violations: Vec<String>,
    pub within_limits: bool,
}

/// Resource usage of this process, sampled for session trajectories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub threads: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_values() {
        let b = ResourceBudget::default();
        assert_eq!(b.max_cpu_percent, 50.0);
        assert_eq!(b.max_memory_mb, 1024);
        assert_eq!(b.max_duration_minutes, 120);
        assert_eq!(b.max_concurrent_sessions, 1);
        assert_eq!(b.min_battery_percent, 30.0);
        assert_eq!(b.max_temperature_celsius, 70.0);
        assert_eq!(b.max_duration(), Duration::from_secs(7200));
    }

    #[test]
    fn partial_budget_fills_defaults() {
        let b: ResourceBudget = serde_json::from_str(r#"{"max_cpu_percent": 80.0}"#).unwrap();
        assert_eq!(b.max_cpu_percent, 80.0);
        assert_eq!(b.max_memory_mb, 1024);
        assert_eq!(b.max_concurrent_sessions, 1);
    }
}
