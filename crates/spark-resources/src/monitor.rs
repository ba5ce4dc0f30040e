use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::probe::{CpuBaseline, MetricsProbe, SystemMetrics, SystemProbe};
use crate::types::{ProcessUsage, ResourceBudget, ResourceSnapshot};

/// Admission gate comparing live metrics against a [`ResourceBudget`].
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn MetricsProbe>,
    wait_poll: Duration,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn MetricsProbe>) -> Self {
        Self {
            probe,
            wait_poll: Duration::from_secs(spark_core::config::DEFAULT_WAIT_POLL_SECS),
        }
    }

    /// Monitor backed by procfs/sysfs, configured from `[resources]`.
    pub fn from_config(config: &spark_core::config::ResourcesConfig) -> Self {
        let probe = SystemProbe::new(Duration::from_millis(config.cpu_sample_window_ms));
        Self::new(Arc::new(probe)).with_wait_poll(Duration::from_secs(config.wait_poll_secs))
    }

    pub fn with_wait_poll(mut self, poll: Duration) -> Self {
        self.wait_poll = poll;
        self
    }

    /// Sample the machine and evaluate `budget`.
    pub async fn check(&self, budget: &ResourceBudget) -> ResourceSnapshot {
        let metrics = self.probe.sample().await;
        let snapshot = evaluate(budget, &metrics);
        if !snapshot.within_limits {
            debug!(violations = ?snapshot.violations, "resource budget exceeded");
        }
        snapshot
    }

    /// Poll [`check`](Self::check) until the budget is met or `timeout_minutes`
    /// elapse. Returns whether the budget was met.
    pub async fn wait_for(&self, budget: &ResourceBudget, timeout_minutes: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_minutes * 60);
        loop {
            let snapshot = self.check(budget).await;
            if snapshot.within_limits {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    timeout_minutes,
                    violations = ?snapshot.violations,
                    "timed out waiting for resources"
                );
                return false;
            }
            info!(violations = ?snapshot.violations, "waiting for resources");
            tokio::time::sleep(self.wait_poll.min(deadline - now)).await;
        }
    }

    /// Usage of this process, for per-session resource accounting.
    pub fn process_usage(&self, baseline: &mut CpuBaseline) -> ProcessUsage {
        self.probe.process_usage(baseline)
    }
}

/// Pure comparison of sampled metrics against a budget.
///
/// Unknown battery reads as 100 % and unknown temperature as 0 °C. A limit of
/// zero disables its check.
pub fn evaluate(budget: &ResourceBudget, metrics: &SystemMetrics) -> ResourceSnapshot {
    let battery_percent = metrics.battery_percent.unwrap_or(100.0);
    let temperature_celsius = metrics.temperature_celsius.unwrap_or(0.0);
    let mut violations = Vec::new();

    if budget.max_cpu_percent > 0.0 && metrics.cpu_percent > budget.max_cpu_percent {
        violations.push(format!(
            "CPU usage ({:.1}% > {}%)",
            metrics.cpu_percent, budget.max_cpu_percent
        ));
    }
    if budget.max_memory_mb > 0 && metrics.memory_mb > budget.max_memory_mb {
        violations.push(format!(
            "Memory usage ({}MB > {}MB)",
            metrics.memory_mb, budget.max_memory_mb
        ));
    }
    if budget.min_battery_percent > 0.0 && battery_percent < budget.min_battery_percent {
        violations.push(format!(
            "Battery low ({}% < {}%)",
            battery_percent, budget.min_battery_percent
        ));
    }
    if budget.max_temperature_celsius > 0.0 && temperature_celsius > budget.max_temperature_celsius
    {
        violations.push(format!(
            "Temperature high ({}°C > {}°C)",
            temperature_celsius, budget.max_temperature_celsius
        ));
    }

    ResourceSnapshot {
        cpu_percent: metrics.cpu_percent,
        memory_percent: metrics.memory_percent,
        memory_mb: metrics.memory_mb,
        battery_percent,
        temperature_celsius,
        within_limits: violations.is_empty(),
        violations,
    }
}
