//! Five-field cron expressions evaluated in an IANA timezone.
//!
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
//! When both day fields are restricted a date matches if either one does.
//! Local times that fall in a DST gap are skipped; ambiguous local times
//! fire at the earlier instant.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Days searched before giving up (covers Feb 29 expressions).
const SEARCH_DAYS: i64 = 8 * 366;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{part}': {reason}")]
    InvalidField {
        field: &'static str,
        part: String,
        reason: String,
    },
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: BTreeSet<u32>,
    /// False when the field was written as `*` or `*/n`.
    restricted: bool,
}

impl CronField {
    fn parse(name: &'static str, expr: &str, min: u32, max: u32) -> Result<Self, CronParseError> {
        let mut values = BTreeSet::new();
        for part in expr.split(',') {
            parse_part(name, part.trim(), min, max, &mut values)?;
        }
        Ok(Self {
            values,
            restricted: !expr.starts_with('*'),
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

fn parse_part(
    field: &'static str,
    part: &str,
    min: u32,
    max: u32,
    out: &mut BTreeSet<u32>,
) -> Result<(), CronParseError> {
    let invalid = |reason: &str| CronParseError::InvalidField {
        field,
        part: part.to_string(),
        reason: reason.to_string(),
    };
    let number = |s: &str| s.parse::<u32>().map_err(|_| invalid("not a number"));

    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step = number(step)?;
            if step == 0 {
                return Err(invalid("step must be positive"));
            }
            (range, step)
        }
        None => (part, 1),
    };

    let (start, end) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        let (a, b) = (number(a)?, number(b)?);
        if a > b {
            return Err(invalid("range start is after its end"));
        }
        (a, b)
    } else {
        let v = number(range)?;
        // `5/15` means "from 5 to the end, every 15".
        if step > 1 {
            (v, max)
        } else {
            (v, v)
        }
    };

    for value in [start, end] {
        if value < min || value > max {
            return Err(CronParseError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
    }

    out.extend((start..=end).step_by(step as usize));
    Ok(())
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::FieldCount(parts.len()));
        }

        let mut day_of_week = CronField::parse("day-of-week", parts[4], 0, 7)?;
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            source: parts.join(" "),
            minute: CronField::parse("minute", parts[0], 0, 59)?,
            hour: CronField::parse("hour", parts[1], 0, 23)?,
            day_of_month: CronField::parse("day-of-month", parts[2], 1, 31)?,
            month: CronField::parse("month", parts[3], 1, 12)?,
            day_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month()) {
            return false;
        }
        let dom = self.day_of_month.matches(date.day());
        let dow = self.day_of_week.matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First fire time strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let start = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local)
            + Duration::minutes(1);

        let mut date = start.date();
        for _ in 0..SEARCH_DAYS {
            if self.date_matches(date) {
                for &hour in &self.hour.values {
                    for &minute in &self.minute.values {
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if naive < start {
                            continue;
                        }
                        if let Some(at) = resolve_local(tz, naive, after) {
                            return Some(at);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Next fire time for a timer that last fired at `last_fired`. Never
    /// returns `last_fired` again, even if `now` reads slightly before it.
    pub fn next_fire(
        &self,
        now: DateTime<Utc>,
        last_fired: Option<DateTime<Utc>>,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        let after = last_fired.map_or(now, |fired| now.max(fired));
        self.next_after(after, tz)
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, tz: Tz, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor, tz) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }
}

/// Map a local wall-clock time to an instant after `after`. Gaps yield
/// `None`; ambiguous times prefer the earlier instant.
fn resolve_local(tz: Tz, naive: NaiveDateTime, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)).filter(|at| *at > after),
        LocalResult::Ambiguous(earliest, latest) => [earliest, latest]
            .into_iter()
            .map(|dt| dt.with_timezone(&Utc))
            .find(|at| *at > after),
        LocalResult::None => None,
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

/// Parse an IANA timezone identifier such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.parse::<Tz>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn lagging_wall_clock_does_not_repeat_a_fire_time() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let fired = utc(2024, 1, 2, 2, 0);
        let lagging = fired - Duration::milliseconds(5);

        assert_eq!(expr.next_after(lagging, Tz::UTC), Some(fired));
        assert_eq!(
            expr.next_fire(lagging, Some(fired), Tz::UTC),
            Some(utc(2024, 1, 3, 2, 0))
        );
        assert_eq!(expr.next_fire(lagging, None, Tz::UTC), Some(fired));
    }

    #[test]
    fn daily_preset_in_utc() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        assert_eq!(
            expr.next_after(utc(2024, 1, 1, 10, 0), Tz::UTC),
            Some(utc(2024, 1, 2, 2, 0))
        );
    }

    #[test]
    fn next_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        assert_eq!(
            expr.next_after(utc(2024, 1, 15, 14, 0), Tz::UTC),
            Some(utc(2024, 1, 15, 15, 0))
        );
        assert_eq!(
            expr.next_after(utc(2024, 1, 15, 14, 30), Tz::UTC),
            Some(utc(2024, 1, 15, 15, 0))
        );
    }

    #[test]
    fn lists_ranges_and_steps() {
        let expr = CronExpr::parse("*/15 9-17 * * 1-5").unwrap();
        assert_eq!(expr.minute.values.len(), 4);
        assert_eq!(expr.hour.values.len(), 9);
        // Saturday 2024-01-06 → Monday 09:00.
        assert_eq!(
            expr.next_after(utc(2024, 1, 6, 12, 0), Tz::UTC),
            Some(utc(2024, 1, 8, 9, 0))
        );
        let expr = CronExpr::parse("5,35 * * * *").unwrap();
        assert_eq!(
            expr.next_after(utc(2024, 1, 1, 0, 6), Tz::UTC),
            Some(utc(2024, 1, 1, 0, 35))
        );
    }

    #[test]
    fn seven_is_sunday() {
        let a = CronExpr::parse("0 2 * * 7").unwrap();
        let b = CronExpr::parse("0 2 * * 0").unwrap();
        let from = utc(2024, 1, 1, 0, 0);
        assert_eq!(a.next_after(from, Tz::UTC), b.next_after(from, Tz::UTC));
        assert_eq!(a.next_after(from, Tz::UTC), Some(utc(2024, 1, 7, 2, 0)));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 15th or any Monday.
        let expr = CronExpr::parse("0 0 15 * 1").unwrap();
        assert_eq!(
            expr.next_after(utc(2024, 1, 9, 0, 0), Tz::UTC),
            Some(utc(2024, 1, 15, 0, 0))
        );
        assert_eq!(
            expr.next_after(utc(2024, 1, 2, 0, 0), Tz::UTC),
            Some(utc(2024, 1, 8, 0, 0))
        );
    }

    #[test]
    fn evaluates_in_the_given_timezone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        // 02:00 CET is 01:00 UTC in winter.
        assert_eq!(
            expr.next_after(utc(2024, 1, 1, 10, 0), tz),
            Some(utc(2024, 1, 2, 1, 0))
        );
    }

    #[test]
    fn dst_gap_is_skipped() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        // 2024-03-31 02:30 does not exist in Berlin; next is April 1st 02:30 CEST.
        assert_eq!(
            expr.next_after(utc(2024, 3, 30, 12, 0), tz),
            Some(utc(2024, 4, 1, 0, 30))
        );
    }

    #[test]
    fn dst_overlap_fires_once_at_earliest() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        // 2024-10-27 02:30 happens twice; the CEST one is 00:30 UTC.
        let first = expr.next_after(utc(2024, 10, 26, 12, 0), tz).unwrap();
        assert_eq!(first, utc(2024, 10, 27, 0, 30));
        assert_eq!(expr.next_after(first, tz), Some(utc(2024, 10, 28, 1, 30)));
    }

    #[test]
    fn leap_day_is_found() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            expr.next_after(utc(2024, 3, 1, 0, 0), Tz::UTC),
            Some(utc(2028, 2, 29, 0, 0))
        );
    }

    #[test]
    fn impossible_date_has_no_next_run() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        assert_eq!(expr.next_after(utc(2024, 1, 1, 0, 0), Tz::UTC), None);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(CronExpr::parse("* * * *"), Err(CronParseError::FieldCount(4)));
        assert!(matches!(
            CronExpr::parse("60 * * * *"),
            Err(CronParseError::OutOfRange { field: "minute", .. })
        ));
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn upcoming_returns_consecutive_runs() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let runs = expr.upcoming(utc(2024, 1, 1, 10, 0), Tz::UTC, 3);
        assert_eq!(
            runs,
            vec![utc(2024, 1, 2, 2, 0), utc(2024, 1, 3, 2, 0), utc(2024, 1, 4, 2, 0)]
        );
    }

    #[test]
    fn timezone_names_are_validated() {
        assert!(parse_timezone("America/New_York").is_some());
        assert!(parse_timezone("Mars/Olympus").is_none());
    }
}
