//! Schedule expressions for recurring jobs.
//!
//! Supported forms, all evaluated in UTC:
//!
//! - 6 or 7 field cron (`sec min hour day-of-month month day-of-week [year]`)
//! - 5 field cron (`min hour day-of-month month day-of-week`), seconds fixed at `0`
//! - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly`
//! - `@every <duration>` with a humantime duration such as `@every 15m`

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CadenceError, Result};

const EVERY_PREFIX: &str = "@every";

/// A parsed, validated schedule expression.
#[derive(Debug, Clone)]
pub enum ScheduleExpr {
    Cron {
        source: String,
        schedule: Box<cron::Schedule>,
    },
    /// Fixed interval, anchored at the previous fire time
    Every { source: String, interval: Duration },
}

impl ScheduleExpr {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let source = expression.trim();
        if source.is_empty() {
            return Err(CadenceError::invalid_schedule(expression, "expression is empty"));
        }

        if let Some(rest) = source.strip_prefix(EVERY_PREFIX) {
            let rest = rest.trim();
            let interval = humantime::parse_duration(rest)
                .map_err(|e| CadenceError::invalid_schedule(expression, e.to_string()))?;
            if interval.is_zero() {
                return Err(CadenceError::invalid_schedule(expression, "interval must be positive"));
            }
            return Ok(Self::Every {
                source: source.to_string(),
                interval,
            });
        }

        let normalized = if source.starts_with('@') {
            source.to_string()
        } else {
            match source.split_whitespace().count() {
                5 => format!("0 {}", source),
                6 | 7 => source.to_string(),
                n => {
                    return Err(CadenceError::invalid_schedule(
                        expression,
                        format!("expected 5, 6 or 7 fields, found {}", n),
                    ))
                }
            }
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| CadenceError::invalid_schedule(expression, e.to_string()))?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(CadenceError::invalid_schedule(expression, "expression never fires"));
        }

        Ok(Self::Cron {
            source: source.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// The first fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { schedule, .. } => schedule.after(&after).next(),
            Self::Every { interval, .. } => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }

    /// Up to `count` consecutive fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::with_capacity(count);
        let mut cursor = after;
        while fires.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    fires.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        fires
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Cron { source, .. } | Self::Every { source, .. } => source,
        }
    }
}

impl FromStr for ScheduleExpr {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ScheduleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
