//! Cron expression parsing and evaluation.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ ┌───────────── day of week (0-7, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! When both day fields are restricted a day matches if *either* does (the
//! classic cron rule); when one of them starts with `*` both must match.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

/// How many calendar years ahead the search gives up. Covers leap-day-only
/// expressions (every fourth year) with room to spare.
const SEARCH_YEARS: i32 = 8;

/// Widest DST shift in the tz database is one hour; two leaves headroom.
const FOLD_LOOKBACK_HOURS: i64 = 2;

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("Invalid cron expression: expected 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Value {value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("Invalid step value: {0}")]
    InvalidStep(String),
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    /// The set of valid values for this field.
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
    /// False when the field text starts with `*`.
    restricted: bool,
}

impl CronField {
    fn parse(expr: &str, min: u32, max: u32) -> Result<Self, CronParseError> {
        let mut field = Self {
            values: BTreeSet::new(),
            min,
            max,
            restricted: !expr.starts_with('*'),
        };
        for part in expr.split(',') {
            field.parse_part(part.trim())?;
        }
        Ok(field)
    }

    fn parse_part(&mut self, part: &str) -> Result<(), CronParseError> {
        if part.is_empty() {
            return Err(CronParseError::InvalidField {
                field: part.to_string(),
                reason: "empty list element".to_string(),
            });
        }

        // Step values (e.g. */5, 0-30/5, 10/15)
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronParseError::InvalidStep("0".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = parse_value(lo, range_part, "invalid start of range")?;
            let end = parse_value(hi, range_part, "invalid end of range")?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = parse_value(range_part, range_part, "invalid value")?;
            // `N/S` means "from N to the end of the range, every S".
            if step.is_some() {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1) as usize;
        self.values.extend((start..=end).step_by(step));
        Ok(())
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Get the next matching value >= given value.
    pub fn next(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    /// Get the first matching value.
    pub fn first(&self) -> Option<u32> {
        self.values.iter().next().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn parse_value(s: &str, field: &str, reason: &str) -> Result<u32, CronParseError> {
    s.parse::<u32>().map_err(|_| CronParseError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expr: String,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// Normalised to 0-6 with 0 = Sunday.
    pub day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = parts.as_slice() else {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        };

        let mut day_of_week = CronField::parse(dow, 0, 7)?;
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }
        day_of_week.max = 6;

        Ok(Self {
            expr: expr.split_whitespace().collect::<Vec<_>>().join(" "),
            minute: CronField::parse(minute, 0, 59)?,
            hour: CronField::parse(hour, 0, 23)?,
            day_of_month: CronField::parse(dom, 1, 31)?,
            month: CronField::parse(month, 1, 12)?,
            day_of_week,
        })
    }

    /// The normalised source text.
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Day-level match honouring the DOM/DOW OR rule.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month()) {
            return false;
        }
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Check if a local wall-clock minute matches this expression.
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        self.matches_date(local.date())
            && self.hour.matches(local.hour())
            && self.minute.matches(local.minute())
    }

    /// The smallest instant strictly after `after` whose wall-clock time in
    /// `tz` matches. `None` if nothing matches within the search window.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let forward = self.scan_from(local, tz, after);
        // Inside a fall-back fold the repeated hour lies *behind* `after` in
        // wall-clock order, so also scan from slightly earlier and keep the
        // smaller instant.
        let folded = self.scan_from(local - Duration::hours(FOLD_LOOKBACK_HOURS), tz, after);
        match (forward, folded) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Walk wall-clock minutes from `start` and return the first whose
    /// instant in `tz` is after `after`.
    fn scan_from(&self, start: NaiveDateTime, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = start.year().saturating_add(SEARCH_YEARS);
        let mut date = start.date();
        let mut hour = start.hour();
        let mut minute = start.minute();

        while date.year() <= horizon {
            if !self.month.matches(date.month()) {
                date = self.first_day_of_next_month(date)?;
                hour = 0;
                minute = 0;
                continue;
            }
            if self.matches_date(date) {
                while let Some(h) = self.hour.next(hour) {
                    if h != hour {
                        minute = 0;
                    }
                    while let Some(m) = self.minute.next(minute) {
                        let local = date.and_time(NaiveTime::from_hms_opt(h, m, 0)?);
                        if let Some(found) = resolve_local(tz, &local, after) {
                            return Some(found);
                        }
                        minute = m + 1;
                    }
                    hour = h + 1;
                    minute = 0;
                }
            }
            date = date.succ_opt()?;
            hour = 0;
            minute = 0;
        }

        None
    }

    fn first_day_of_next_month(&self, date: NaiveDate) -> Option<NaiveDate> {
        match self.month.next(date.month() + 1) {
            Some(month) => NaiveDate::from_ymd_opt(date.year(), month, 1),
            None => NaiveDate::from_ymd_opt(date.year() + 1, self.month.first()?, 1),
        }
    }
}

/// Map a local wall-clock time to the earliest UTC instant after `after`.
/// Times inside a DST gap do not exist and yield `None`.
fn resolve_local(tz: Tz, local: &NaiveDateTime, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)).filter(|t| *t > after),
        LocalResult::Ambiguous(early, late) => [early, late]
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .find(|t| *t > after),
        LocalResult::None => None,
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}
