use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use spark_resources::ResourceBudget;
use spark_scheduler::{JobSpec, Schedule};

use crate::command::COMMAND_TASK;

/// sparkd - resource-aware scheduler for recurring exploration jobs
#[derive(Parser)]
#[command(name = "sparkd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $SPARK_CONFIG, then ~/.spark/spark.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// List stored jobs
    List {
        /// Print the full job records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show scheduler and platform status
    Status,

    /// Add a job
    Add(AddArgs),

    /// Pause a job; it is not dispatched until resumed
    Pause {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Resume a paused job from now
    Resume {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Delete a job
    Remove {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Run a job once now and wait for it to finish
    Trigger {
        #[arg(value_name = "JOB_ID")]
        id: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "3600")]
        wait_secs: u64,
    },
}

#[derive(Args)]
pub struct AddArgs {
    /// Human-readable job name
    #[arg(long)]
    pub name: String,

    /// daily@HH:MM, weekdays@HH:MM, weekends@HH:MM, weekly:DAY@HH:MM,
    /// every:N[m|h] or cron:EXPR
    #[arg(long, value_name = "SPEC")]
    pub schedule: String,

    /// Shell command for the built-in `command` task
    #[arg(long, conflicts_with = "task")]
    pub command: Option<String>,

    /// Registered task function name
    #[arg(long)]
    pub task: Option<String>,

    /// JSON arguments passed to the task function
    #[arg(long, value_name = "JSON")]
    pub args: Option<String>,

    /// Per-attempt timeout for `--command`
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long = "tag")]
    pub tags: Vec<String>,

    #[arg(long)]
    pub max_cpu: Option<f64>,

    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    #[arg(long)]
    pub max_duration_minutes: Option<u64>,

    #[arg(long)]
    pub max_concurrent: Option<usize>,

    #[arg(long)]
    pub min_battery: Option<f64>,
}

impl AddArgs {
    pub fn into_spec(self) -> anyhow::Result<JobSpec> {
        let schedule = parse_schedule(&self.schedule)?;

        let mut args = match &self.args {
            Some(raw) => serde_json::from_str::<Value>(raw).context("--args is not valid JSON")?,
            None => json!({}),
        };
        let task = match (self.command, self.task) {
            (Some(cmd), _) => {
                let obj = args
                    .as_object_mut()
                    .ok_or_else(|| anyhow!("--args must be a JSON object when used with --command"))?;
                obj.insert("command".into(), Value::String(cmd));
                if let Some(secs) = self.timeout_secs {
                    obj.insert("timeout_secs".into(), json!(secs));
                }
                COMMAND_TASK.to_string()
            }
            (None, Some(task)) => task,
            (None, None) => bail!("either --command or --task is required"),
        };

        let mut budget = ResourceBudget::default();
        if let Some(v) = self.max_cpu {
            budget.max_cpu_percent = v;
        }
        if let Some(v) = self.max_memory_mb {
            budget.max_memory_mb = v;
        }
        if let Some(v) = self.max_duration_minutes {
            budget.max_duration_minutes = v;
        }
        if let Some(v) = self.max_concurrent {
            budget.max_concurrent_sessions = v;
        }
        if let Some(v) = self.min_battery {
            budget.min_battery_percent = v;
        }

        Ok(JobSpec::new(self.name, schedule, task)
            .args(args)
            .budget(budget)
            .tags(self.tags)
            .created_by("cli"))
    }
}

/// Parse the compact schedule notation accepted by `sparkd add`.
pub fn parse_schedule(spec: &str) -> anyhow::Result<Schedule> {
    let spec = spec.trim();
    if let Some(expr) = spec.strip_prefix("cron:") {
        return Ok(Schedule::Cron {
            expression: expr.trim().to_string(),
        });
    }
    if let Some(every) = spec.strip_prefix("every:") {
        return Ok(Schedule::Interval {
            interval_minutes: parse_minutes(every)?,
        });
    }

    let (kind, time) = match spec.split_once('@') {
        Some((k, t)) => (k, Some(parse_time(t)?)),
        None => (spec, None),
    };
    let schedule = match kind.split_once(':') {
        Some(("weekly", day)) => {
            let (hour, minute) = time.unwrap_or((2, 0));
            Schedule::Weekly {
                day_of_week: parse_day(day)?,
                hour,
                minute,
            }
        }
        Some(_) => bail!("unknown schedule '{spec}'"),
        None => match kind {
            "daily" => {
                let (hour, minute) = time.unwrap_or((2, 0));
                Schedule::Daily { hour, minute }
            }
            "weekdays" => {
                let (hour, minute) = time.unwrap_or((2, 0));
                Schedule::Weekdays { hour, minute }
            }
            "weekends" => {
                let (hour, minute) = time.unwrap_or((10, 0));
                Schedule::Weekends { hour, minute }
            }
            _ => bail!("unknown schedule '{spec}'"),
        },
    };
    Ok(schedule)
}

fn parse_time(s: &str) -> anyhow::Result<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected HH:MM, got '{s}'"))?;
    let hour: u32 = h.parse().with_context(|| format!("bad hour in '{s}'"))?;
    let minute: u32 = m.parse().with_context(|| format!("bad minute in '{s}'"))?;
    Ok((hour, minute))
}

fn parse_day(s: &str) -> anyhow::Result<u32> {
    let day = match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => 0,
        "tue" | "tuesday" => 1,
        "wed" | "wednesday" => 2,
        "thu" | "thursday" => 3,
        "fri" | "friday" => 4,
        "sat" | "saturday" => 5,
        "sun" | "sunday" => 6,
        other => other
            .parse()
            .with_context(|| format!("unknown weekday '{s}'"))?,
    };
    Ok(day)
}

fn parse_minutes(s: &str) -> anyhow::Result<u32> {
    let s = s.trim();
    let (num, factor) = if let Some(n) = s.strip_suffix('h') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1)
    } else {
        (s, 1)
    };
    let n: u32 = num.parse().with_context(|| format!("bad interval '{s}'"))?;
    n.checked_mul(factor)
        .ok_or_else(|| anyhow!("interval '{s}' is too large"))
}
