//! Agent schedules. Plain data: the executor never reads them, only the
//! trigger loop in [`crate::app`] does.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc, Weekday};

use crate::error::ConfigError;

/// Shortest period an interval schedule fires at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// When an agent should fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period between fires.
    Interval(Duration),
    /// Cron expression, 5 fields (minute first) or 6 fields (second first).
    Cron(String),
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Schedule::Interval(period)
    }

    pub fn every_seconds(n: u64) -> Self {
        Schedule::Interval(Duration::from_secs(n))
    }

    pub fn every_minutes(n: u64) -> Self {
        Schedule::Interval(Duration::from_secs(n.saturating_mul(60)))
    }

    pub fn every_hours(n: u64) -> Self {
        Schedule::Interval(Duration::from_secs(n.saturating_mul(3600)))
    }

    pub fn hourly() -> Self {
        Self::every_hours(1)
    }

    /// Every day at `HH:MM` (UTC).
    pub fn daily_at(time: &str) -> Result<Self, ConfigError> {
        let (hour, minute) = parse_time(time)?;
        Ok(Schedule::Cron(format!("{minute} {hour} * * *")))
    }

    /// Every week on `day` at `HH:MM` (UTC).
    pub fn weekly_at(day: Weekday, time: &str) -> Result<Self, ConfigError> {
        let (hour, minute) = parse_time(time)?;
        Ok(Schedule::Cron(format!("{minute} {hour} * * {day}")))
    }

    /// Validated cron expression.
    pub fn cron(expression: &str) -> Result<Self, ConfigError> {
        let expression = expression.trim().to_string();
        parse_cron(&expression)?;
        Ok(Schedule::Cron(expression))
    }

    /// Next fire time strictly after `after`. Intervals shorter than one
    /// second fire once per second.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        match self {
            Schedule::Interval(period) => {
                let step = chrono::Duration::from_std((*period).max(MIN_INTERVAL))
                    .map_err(|e| ConfigError::InvalidSchedule(e.to_string()))?;
                Ok(after + step)
            }
            Schedule::Cron(expression) => parse_cron(expression)?
                .after(&after)
                .next()
                .ok_or_else(|| {
                    ConfigError::InvalidSchedule(format!("'{expression}' never fires again"))
                }),
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Interval(period) => {
                let secs = period.as_secs();
                if period.subsec_nanos() != 0 || secs == 0 {
                    write!(f, "every {}ms", period.as_millis())
                } else if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
            Schedule::Cron(expression) => write!(f, "cron({expression})"),
        }
    }
}

/// The `cron` crate wants a seconds field; classic 5-field input gets one.
fn parse_cron(expression: &str) -> Result<cron::Schedule, ConfigError> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| ConfigError::InvalidSchedule(format!("invalid cron '{expression}': {e}")))
}

fn parse_time(time: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidSchedule(format!("Expected HH:MM format, got: {time}"));
    let (hour, minute) = time.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
    let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}
