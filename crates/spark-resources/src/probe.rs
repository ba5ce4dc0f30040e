//! Metric sources. [`SystemProbe`] reads procfs/sysfs; [`FixedProbe`]
//! returns caller-controlled values.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::types::ProcessUsage;

/// Raw machine metrics. `None` means the platform does not expose the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_mb: u64,
    pub battery_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
}

/// Source of live resource metrics.
#[async_trait]
pub trait MetricsProbe: Send + Sync {
    /// Sample machine-wide metrics. May suspend for the CPU sampling window.
    async fn sample(&self) -> SystemMetrics;

    /// Usage of the current process. CPU% covers the time since `baseline`
    /// was last updated, so each caller keeps its own baseline.
    fn process_usage(&self, baseline: &mut CpuBaseline) -> ProcessUsage;
}

/// Previous (process CPU seconds, instant) reading of one caller.
///
/// The percentage is process-wide: concurrent sessions share the process, so
/// each sees the combined load over its own sampling intervals.
#[derive(Debug, Clone, Default)]
pub struct CpuBaseline {
    last: Option<(f64, Instant)>,
}

impl CpuBaseline {
    /// CPU% since the previous reading, then remember this one. The first
    /// reading yields 0.
    pub fn percent(&mut self, cpu_secs: f64, now: Instant) -> f64 {
        let pct = match self.last {
            Some((prev_secs, prev_at)) => {
                let elapsed = now.saturating_duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    ((cpu_secs - prev_secs).max(0.0) / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((cpu_secs, now));
        pct
    }
}

// ---------------------------------------------------------------------------
// SystemProbe
// ---------------------------------------------------------------------------

/// Reads `/proc` and `/sys` on Linux. Elsewhere every metric is unknown and
/// reported as zero, which keeps jobs admissible.
pub struct SystemProbe {
    cpu_window: Duration,
}

impl SystemProbe {
    pub fn new(cpu_window: Duration) -> Self {
        Self { cpu_window }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(
            spark_core::config::DEFAULT_CPU_SAMPLE_WINDOW_MS,
        ))
    }
}

#[async_trait]
impl MetricsProbe for SystemProbe {
    async fn sample(&self) -> SystemMetrics {
        let first = read_cpu_times();
        tokio::time::sleep(self.cpu_window).await;
        let second = read_cpu_times();

        let cpu_percent = match (first, second) {
            (Some(a), Some(b)) => cpu_busy_percent(a, b),
            _ => 0.0,
        };
        let (memory_mb, memory_percent) = read_memory().unwrap_or((0, 0.0));

        let metrics = SystemMetrics {
            cpu_percent,
            memory_percent,
            memory_mb,
            battery_percent: read_battery_percent(),
            temperature_celsius: read_cpu_temperature(),
        };
        debug!(?metrics, "system metrics sampled");
        metrics
    }

    fn process_usage(&self, baseline: &mut CpuBaseline) -> ProcessUsage {
        let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
        let memory_mb = status_field_kb(&status, "VmRSS:")
            .map(|kb| kb as f64 / 1024.0)
            .unwrap_or(0.0);
        let threads = status_field_kb(&status, "Threads:").unwrap_or(0);

        let cpu_percent = match read_process_ticks() {
            Some(ticks) => baseline.percent(ticks as f64 / clock_ticks(), Instant::now()),
            None => 0.0,
        };

        ProcessUsage {
            cpu_percent,
            memory_mb,
            threads,
        }
    }
}

/// (busy, total) jiffies from the aggregate `cpu` line of /proc/stat.
fn read_cpu_times() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let rest = line.strip_prefix("cpu ")?;
    let values: Vec<u64> = rest
        .split_whitespace()
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total - idle, total))
}

fn cpu_busy_percent(first: (u64, u64), second: (u64, u64)) -> f64 {
    let busy = second.0.saturating_sub(first.0) as f64;
    let total = second.1.saturating_sub(first.1) as f64;
    if total <= 0.0 {
        0.0
    } else {
        (busy / total) * 100.0
    }
}

/// (used MB, used %) from /proc/meminfo.
fn read_memory() -> Option<(u64, f64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&content)
}

fn parse_meminfo(content: &str) -> Option<(u64, f64)> {
    let total_kb = status_field_kb(content, "MemTotal:")?;
    let available_kb = status_field_kb(content, "MemAvailable:")?;
    let used_kb = total_kb.saturating_sub(available_kb);
    let percent = if total_kb == 0 {
        0.0
    } else {
        used_kb as f64 / total_kb as f64 * 100.0
    };
    Some((used_kb / 1024, percent))
}

/// First numeric value after `key` in a `Key:   value [kB]` style file.
fn status_field_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn read_battery_percent() -> Option<f64> {
    let entries = std::fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("BAT") {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(entry.path().join("capacity")) {
            if let Ok(v) = raw.trim().parse::<f64>() {
                return Some(v);
            }
        }
    }
    None
}

/// Prefer a zone whose type names the CPU package; fall back to the first
/// readable zone.
fn read_cpu_temperature() -> Option<f64> {
    let entries = std::fs::read_dir("/sys/class/thermal").ok()?;
    let mut fallback = None;
    for entry in entries.flatten() {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with("thermal_zone")
        {
            continue;
        }
        let path = entry.path();
        let millideg = match std::fs::read_to_string(path.join("temp"))
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
        {
            Some(v) => v,
            None => continue,
        };
        let celsius = millideg / 1000.0;
        let kind = std::fs::read_to_string(path.join("type"))
            .unwrap_or_default()
            .to_lowercase();
        if kind.contains("cpu") || kind.contains("core") || kind.contains("pkg") {
            return Some(celsius);
        }
        fallback.get_or_insert(celsius);
    }
    fallback
}

/// utime + stime of this process, in clock ticks.
fn read_process_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // comm may contain spaces; fields resume after the closing paren
    let after = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after.split_whitespace().collect();
    // after ')' index 0 is state (field 3); utime is field 14, stime field 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks() -> f64 {
    #[cfg(unix)]
    {
        // Safety: sysconf has no memory-safety preconditions.
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}

// ---------------------------------------------------------------------------
// FixedProbe
// ---------------------------------------------------------------------------

/// Probe returning whatever metrics were last set. Used for dry runs and tests.
#[derive(Default)]
pub struct FixedProbe {
    metrics: Mutex<SystemMetrics>,
    process: Mutex<ProcessUsage>,
}

impl FixedProbe {
    pub fn new(metrics: SystemMetrics) -> Self {
        Self {
            metrics: Mutex::new(metrics),
            process: Mutex::new(ProcessUsage::default()),
        }
    }

    /// An idle machine: no load, battery and temperature unknown.
    pub fn idle() -> Self {
        Self::new(SystemMetrics::default())
    }

    pub fn set(&self, metrics: SystemMetrics) {
        *self
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = metrics;
    }

    pub fn set_process_usage(&self, usage: ProcessUsage) {
        *self
            .process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = usage;
    }
}

#[async_trait]
impl MetricsProbe for FixedProbe {
    async fn sample(&self) -> SystemMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn process_usage(&self, _baseline: &mut CpuBaseline) -> ProcessUsage {
        self.process
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_line_excludes_idle_and_iowait() {
        let (busy, total) = parse_cpu_line("cpu  100 0 100 700 100 0 0 0 0 0").unwrap();
        assert_eq!(total, 1000);
        assert_eq!(busy, 200);
    }

    #[test]
    fn baselines_are_independent() {
        let t0 = Instant::now();
        let mut a = CpuBaseline::default();
        let mut b = CpuBaseline::default();

        assert_eq!(a.percent(1.0, t0), 0.0);
        let pct = a.percent(2.0, t0 + Duration::from_secs(2));
        assert!((pct - 50.0).abs() < 1e-9);

        // a second caller starts its own interval and leaves `a` untouched
        assert_eq!(b.percent(2.0, t0 + Duration::from_secs(2)), 0.0);
        let pct = b.percent(3.0, t0 + Duration::from_secs(3));
        assert!((pct - 100.0).abs() < 1e-9);
        let pct = a.percent(3.0, t0 + Duration::from_secs(4));
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let pct = cpu_busy_percent((200, 1000), (500, 1500));
        assert!((pct - 60.0).abs() < f64::EPSILON);
        assert_eq!(cpu_busy_percent((10, 10), (10, 10)), 0.0);
    }

    #[test]
    fn meminfo_used_is_total_minus_available() {
        let content = "MemTotal:       8192000 kB\nMemFree:  100 kB\nMemAvailable:   4096000 kB\n";
        let (mb, pct) = parse_meminfo(content).unwrap();
        assert_eq!(mb, 4000);
        assert!((pct - 50.0).abs() < 0.001);
    }

    #[test]
    fn meminfo_without_available_is_unknown() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
    }

    #[tokio::test]
    async fn fixed_probe_returns_latest_values() {
        let probe = FixedProbe::idle();
        assert_eq!(probe.sample().await.cpu_percent, 0.0);
        probe.set(SystemMetrics {
            cpu_percent: 42.0,
            ..SystemMetrics::default()
        });
        assert_eq!(probe.sample().await.cpu_percent, 42.0);
    }
}
