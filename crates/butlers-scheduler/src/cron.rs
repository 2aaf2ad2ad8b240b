//! 5-field UTC cron expressions.
//!
//! Field order is the classic `minute hour day-of-month month day-of-week`.
//! Supported syntax per field: `*`, `*/step`, `a`, `a-b`, `a-b/step`, and
//! comma-joined lists. Day-of-week 0 and 7 both mean Sunday. When both
//! day fields are restricted, a date matches if either does (standard
//! cron OR semantics).

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::{SchedulerError, SchedulerResult};

/// One parsed field: a 64-bit set of allowed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.bits & (1_u64 << value) != 0
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    expression: String,
}

fn parse_field(raw: &str, min: u32, max: u32, expression: &str) -> SchedulerResult<FieldSet> {
    let err = |reason: String| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let mut bits = 0_u64;
    let mut restricted = true;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("bad step '{step}'")))?;
                if step == 0 {
                    return Err(err("step must be positive".to_string()));
                }
                (range, step)
            },
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            if part == "*" {
                restricted = false;
            }
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| err(format!("bad value '{lo}'")))?;
            let hi: u32 = hi.parse().map_err(|_| err(format!("bad value '{hi}'")))?;
            (lo, hi)
        } else {
            let v: u32 = range.parse().map_err(|_| err(format!("bad value '{range}'")))?;
            (v, v)
        };

        if lo > hi {
            return Err(err(format!("inverted range {lo}-{hi}")));
        }
        for v in (lo..=hi).step_by(step as usize) {
            // 7 aliases Sunday in the day-of-week field.
            let v = if max == 7 && v == 7 { 0 } else { v };
            if (v < min && !(max == 7 && v == 0)) || v > max {
                return Err(err(format!("value {v} outside {min}-{max}")));
            }
            bits |= 1_u64 << v;
        }
    }
    if bits == 0 {
        return Err(err("empty field".to_string()));
    }
    Ok(FieldSet { bits, restricted })
}

impl CronSchedule {
    /// Parse a 5-field expression.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCron`] on malformed input.
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59, expression)?,
            hours: parse_field(fields[1], 0, 23, expression)?,
            days_of_month: parse_field(fields[2], 1, 31, expression)?,
            months: parse_field(fields[3], 1, 12, expression)?,
            days_of_week: parse_field(fields[4], 0, 7, expression)?,
            expression: expression.to_string(),
        })
    }

    /// The original expression text.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, date: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.days_of_month.restricted, self.days_of_week.restricted) {
            // Standard cron: both restricted is an OR.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Whether an instant (truncated to the minute) matches.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(at.minute())
            && self.hours.contains(at.hour())
            && self.months.contains(at.month())
            && self.day_matches(at)
    }

    /// The first matching minute strictly after `after`.
    ///
    /// Searches up to four years out, which covers every satisfiable
    /// 5-field expression (including Feb 29 schedules).
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = Utc
            .with_ymd_and_hms(after.year(), after.month(), after.day(), after.hour(), after.minute(), 0)
            .single()?
            + Duration::minutes(1);
        let horizon = start + Duration::days(4 * 366);

        let mut candidate = start;
        while candidate < horizon {
            if !self.months.contains(candidate.month()) || !self.day_matches(candidate) {
                // Skip to the next midnight.
                candidate = Utc
                    .with_ymd_and_hms(candidate.year(), candidate.month(), candidate.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if !self.hours.contains(candidate.hour()) {
                candidate = Utc
                    .with_ymd_and_hms(candidate.year(), candidate.month(), candidate.day(), candidate.hour(), 0, 0)
                    .single()?
                    + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// The cadence around `after`: seconds between the next two firings.
    #[must_use]
    pub fn interval_seconds(&self, after: DateTime<Utc>) -> Option<i64> {
        let first = self.next_after(after)?;
        let second = self.next_after(first)?;
        Some((second - first).num_seconds())
    }
}
