//! 5-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! numbers, ranges (`1-5`), lists (`1,15`), steps (`*/10`, `0-30/5`, `5/15`)
//! and, for month and day-of-week, three-letter names. Day-of-week `7` is
//! Sunday.
//!
//! When both day fields are restricted a date matches if either matches;
//! when one of them starts with `*` only the other one decides.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Furthest a search for the next fire time looks ahead
const SEARCH_LIMIT_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Why an expression was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} value '{value}'")]
    InvalidValue { field: CronField, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: CronField,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("invalid {field} range '{value}'")]
    InvalidRange { field: CronField, value: String },

    #[error("invalid {field} step '{value}'")]
    InvalidStep { field: CronField, value: String },
}

/// The five fields of an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    fn bounds(self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            // 7 is folded onto 0 after parsing
            CronField::DayOfWeek => (0, 7),
        }
    }

    fn names(self) -> &'static [&'static str] {
        match self {
            CronField::Month => &MONTH_NAMES,
            CronField::DayOfWeek => &WEEKDAY_NAMES,
            _ => &[],
        }
    }

    fn name_offset(self) -> u32 {
        match self {
            CronField::Month => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day-of-month",
            CronField::Month => "month",
            CronField::DayOfWeek => "day-of-week",
        })
    }
}

/// A parsed cron expression
///
/// Each field is a bitmask of the values it allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    day_of_month_star: bool,
    day_of_week_star: bool,
}

impl CronExpr {
    /// Parse an expression
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount(fields.len()));
        }

        let mut masks = [0u64; 5];
        for (mask, (field, text)) in masks.iter_mut().zip(CronField::ALL.into_iter().zip(&fields)) {
            *mask = parse_field(field, text)?;
        }

        // Sunday may be written as 7
        let mut days_of_week = masks[4];
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: masks[0],
            hours: masks[1],
            days_of_month: masks[2],
            months: masks[3],
            days_of_week,
            day_of_month_star: fields[2].starts_with('*'),
            day_of_week_star: fields[4].starts_with('*'),
        })
    }

    /// Normalized source text
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a local wall-clock minute matches
    pub fn matches(&self, local: &NaiveDateTime) -> bool {
        bit(self.months, local.month())
            && self.matches_day(&local.date())
            && bit(self.hours, local.hour())
            && bit(self.minutes, local.minute())
    }

    fn matches_day(&self, date: &NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.day_of_month_star || self.day_of_week_star {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First fire time strictly after `after`, in the same timezone
    ///
    /// Local times skipped by a DST transition never fire. A local time
    /// repeated by a DST transition fires once, at its earlier instant,
    /// unless `after` already lies between the two instants.
    ///
    /// Returns `None` when nothing matches within five years (for example
    /// `0 0 30 2 *`).
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let timezone = after.timezone();
        let start = after.naive_local().with_second(0)?.with_nanosecond(0)? + TimeDelta::minutes(1);
        let limit_year = start.year() + SEARCH_LIMIT_YEARS;
        let mut candidate = start;

        while candidate.year() <= limit_year {
            if !bit(self.months, candidate.month()) {
                candidate = first_of_next_month(&candidate)?;
                continue;
            }
            if !self.matches_day(&candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = candidate.with_minute(0)? + TimeDelta::hours(1);
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate += TimeDelta::minutes(1);
                continue;
            }

            match timezone.from_local_datetime(&candidate) {
                LocalResult::Single(fire) if fire > *after => return Some(fire),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > *after {
                        return Some(earliest);
                    }
                    if latest > *after {
                        return Some(latest);
                    }
                }
                _ => {}
            }
            candidate += TimeDelta::minutes(1);
        }

        None
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(current: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if current.month() == 12 {
        (current.year() + 1, 1)
    } else {
        (current.year(), current.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(field: CronField, text: &str) -> Result<u64, CronParseError> {
    let mut mask = 0u64;
    for item in text.split(',') {
        mask |= parse_item(field, item)?;
    }
    Ok(mask)
}

fn parse_item(field: CronField, item: &str) -> Result<u64, CronParseError> {
    let (min, max) = field.bounds();

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step.parse().map_err(|_| CronParseError::InvalidStep {
                field,
                value: item.to_string(),
            })?;
            if step == 0 {
                return Err(CronParseError::InvalidStep {
                    field,
                    value: item.to_string(),
                });
            }
            (range, Some(step))
        }
        None => (item, None),
    };

    let (low, high) = if range == "*" {
        (min, max)
    } else if let Some((low, high)) = range.split_once('-') {
        let low = parse_value(field, low)?;
        let high = parse_value(field, high)?;
        if low > high {
            return Err(CronParseError::InvalidRange {
                field,
                value: item.to_string(),
            });
        }
        (low, high)
    } else {
        let value = parse_value(field, range)?;
        // `5/15` means "from 5 to the end, every 15"
        match step {
            Some(_) => (value, max),
            None => (value, value),
        }
    };

    let mut mask = 0u64;
    let step = step.unwrap_or(1) as usize;
    for value in (low..=high).step_by(step) {
        mask |= 1u64 << value;
    }
    Ok(mask)
}

fn parse_value(field: CronField, text: &str) -> Result<u32, CronParseError> {
    let (min, max) = field.bounds();

    let value = match text.parse::<u32>() {
        Ok(value) => value,
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            field
                .names()
                .iter()
                .position(|name| *name == lower)
                .map(|index| index as u32 + field.name_offset())
                .ok_or_else(|| CronParseError::InvalidValue {
                    field,
                    value: text.to_string(),
                })?
        }
    };

    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}
