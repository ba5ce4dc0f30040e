use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Utc, Weekday};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// When a job becomes eligible to run.
///
/// Day-based rules are evaluated in the scheduler's time zone (local by
/// default); `Interval` is zone-independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every day at HH:MM.
    Daily {
        #[serde(default = "default_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// Monday to Friday at HH:MM.
    Weekdays {
        #[serde(default = "default_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// Saturday and Sunday at HH:MM.
    Weekends {
        #[serde(default = "default_weekend_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// One weekday (0 = Monday … 6 = Sunday) at HH:MM, always a later day
    /// than the one the rule is evaluated on.
    Weekly {
        #[serde(default)]
        day_of_week: u32,
        #[serde(default = "default_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// Fixed delay after the previous computation.
    Interval {
        #[serde(default = "default_interval_minutes")]
        interval_minutes: u32,
    },

    /// Standard 5-field cron, 6/7-field cron with seconds, or an `@daily`
    /// style shortcut.
    Cron { expression: String },
}

fn default_hour() -> u32 {
    2
}
fn default_weekend_hour() -> u32 {
    10
}
fn default_interval_minutes() -> u32 {
    60
}

/// Rule used when a stored cron expression no longer parses.
const CRON_FALLBACK: Schedule = Schedule::Daily { hour: 2, minute: 0 };

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Daily { .. } => "daily",
            Schedule::Weekdays { .. } => "weekdays",
            Schedule::Weekends { .. } => "weekends",
            Schedule::Weekly { .. } => "weekly",
            Schedule::Interval { .. } => "interval",
            Schedule::Cron { .. } => "cron",
        }
    }

    /// Reject out-of-range fields and unparseable cron expressions.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Daily { hour, minute }
            | Schedule::Weekdays { hour, minute }
            | Schedule::Weekends { hour, minute } => check_time(*hour, *minute),
            Schedule::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                if *day_of_week > 6 {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "day_of_week must be 0-6, got {day_of_week}"
                    )));
                }
                check_time(*hour, *minute)
            }
            Schedule::Interval { interval_minutes } => {
                if *interval_minutes == 0 {
                    return Err(SchedulerError::InvalidSchedule(
                        "interval_minutes must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
            Schedule::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Schedule::Weekdays { hour, minute } => write!(f, "weekdays at {hour:02}:{minute:02}"),
            Schedule::Weekends { hour, minute } => write!(f, "weekends at {hour:02}:{minute:02}"),
            Schedule::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                let day = weekday_from_index(*day_of_week)
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| format!("day {day_of_week}"));
                write!(f, "weekly on {day} at {hour:02}:{minute:02}")
            }
            Schedule::Interval { interval_minutes } => write!(f, "every {interval_minutes} min"),
            Schedule::Cron { expression } => write!(f, "cron {expression}"),
        }
    }
}

fn check_time(hour: u32, minute: u32) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} is out of range"
        )));
    }
    Ok(())
}

fn weekday_from_index(day: u32) -> Option<Weekday> {
    match day {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

/// The `cron` crate wants a leading seconds field; plain 5-field expressions
/// get `0` prepended. Shortcuts like `@hourly` pass through.
pub fn parse_cron(expression: &str) -> Result<CronSchedule> {
    let expr = expression.trim();
    let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidSchedule(format!("cron {expression:?}: {e}")))
}

/// Next run strictly after `now`, evaluated in the machine's local zone
/// (`use_local_time`) or in UTC.
pub fn next_run_after(
    schedule: &Schedule,
    now: DateTime<Utc>,
    use_local_time: bool,
) -> Option<DateTime<Utc>> {
    if use_local_time {
        compute_next_run(schedule, &now.with_timezone(&Local))
    } else {
        compute_next_run(schedule, &now)
    }
}

/// Compute the next execution time for `schedule`, strictly after `now`, with
/// wall-clock rules interpreted in `now`'s time zone.
///
/// Returns `None` only when a cron expression has no future occurrence. A
/// cron expression that fails to parse falls back to daily at 02:00.
pub fn compute_next_run<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    match schedule {
        Schedule::Daily { hour, minute } => next_matching_day(now, today, *hour, *minute, |_| true),

        Schedule::Weekdays { hour, minute } => {
            next_matching_day(now, today, *hour, *minute, |d| {
                !matches!(d, Weekday::Sat | Weekday::Sun)
            })
        }

        Schedule::Weekends { hour, minute } => {
            next_matching_day(now, today, *hour, *minute, |d| {
                matches!(d, Weekday::Sat | Weekday::Sun)
            })
        }

        Schedule::Weekly {
            day_of_week,
            hour,
            minute,
        } => {
            let target = weekday_from_index((*day_of_week).min(6))?;
            // Search starts tomorrow: the same weekday as today means next week.
            let start = today.succ_opt()?;
            next_matching_day(now, start, *hour, *minute, |d| d == target)
        }

        Schedule::Interval { interval_minutes } => {
            Some(now.with_timezone(&Utc) + Duration::minutes(i64::from((*interval_minutes).max(1))))
        }

        Schedule::Cron { expression } => match parse_cron(expression) {
            Ok(cron) => cron.after(now).next().map(|t| t.with_timezone(&Utc)),
            Err(e) => {
                warn!("{e}; falling back to {}", CRON_FALLBACK);
                compute_next_run(&CRON_FALLBACK, now)
            }
        },
    }
}

/// First day from `start` accepted by `accept` whose HH:MM exists in the zone
/// and lies after `now`. Days where HH:MM falls into a DST gap are skipped.
fn next_matching_day<Tz: TimeZone>(
    now: &DateTime<Tz>,
    start: NaiveDate,
    hour: u32,
    minute: u32,
    accept: impl Fn(Weekday) -> bool,
) -> Option<DateTime<Utc>> {
    let tz = now.timezone();
    let mut date = start;
    for _ in 0..15 {
        if accept(date.weekday()) {
            let candidate = date
                .and_hms_opt(hour.min(23), minute.min(59), 0)
                .and_then(|naive| tz.from_local_datetime(&naive).earliest());
            if let Some(candidate) = candidate {
                if candidate > *now {
                    return Some(candidate.with_timezone(&Utc));
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}
