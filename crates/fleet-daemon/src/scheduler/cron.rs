//! Five-field cron expressions evaluated in UTC.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field accepts
//! `*`, single values, ranges (`a-b`), steps (`*/n`, `a-b/n`, `a/n`) and
//! comma-separated lists. Months and weekdays also accept three-letter names.
//! When both day fields are restricted a day matches if either one does.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

/// Years searched before giving up on an expression that never matches.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid cron expression '{expr}': {reason}")]
pub struct CronError {
    pub expr: String,
    pub reason: String,
}

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    const fn contains(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let expanded = match trimmed {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other => other,
        };

        let err = |reason: String| CronError {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(err(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, None).map_err(&err)?;
        let hours = parse_field(fields[1], 0, 23, None).map_err(&err)?;
        let days_of_month = parse_field(fields[2], 1, 31, None).map_err(&err)?;
        let months = parse_field(fields[3], 1, 12, Some((&MONTH_NAMES, 1))).map_err(&err)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, Some((&DAY_NAMES, 0))).map_err(&err)?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `t` (to the minute) is a scheduled time.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date_naive())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.days_of_month.restricted && self.days_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First scheduled time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.year() + SEARCH_YEARS;
        let mut t = truncate_to_minute(after) + Duration::minutes(1);
        while t.year() <= limit {
            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
            } else if !self.day_matches(t.date_naive()) {
                t = start_of_day(t) + Duration::days(1);
            } else if !self.hours.contains(t.hour()) {
                t = start_of_hour(t) + Duration::hours(1);
            } else if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
            } else {
                return Some(t);
            }
        }
        None
    }

    /// Latest scheduled time at or before `at`.
    pub fn latest_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = at.year() - SEARCH_YEARS;
        let mut t = truncate_to_minute(at);
        while t.year() >= limit {
            if !self.months.contains(t.month()) {
                t = start_of_month(t)? - Duration::minutes(1);
            } else if !self.day_matches(t.date_naive()) {
                t = start_of_day(t) - Duration::minutes(1);
            } else if !self.hours.contains(t.hour()) {
                t = start_of_hour(t) - Duration::minutes(1);
            } else if !self.minutes.contains(t.minute()) {
                t -= Duration::minutes(1);
            } else {
                return Some(t);
            }
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<Field, String> {
    let mut bits = 0u64;
    // A field written from `*`, stepped or not, leaves the day unrestricted.
    let restricted = !field.starts_with('*');

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let value = parse_value(range, names)?;
            // `a/n` runs from `a` to the end of the field.
            (value, if step.is_some() { max } else { value })
        };

        if start < min || end > max || start > end {
            return Err(format!("'{part}' is outside {min}-{max}"));
        }
        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            bits |= 1 << value;
            value += step;
        }
    }

    Ok(Field { bits, restricted })
}

fn parse_value(token: &str, names: Option<(&[&str], u32)>) -> Result<u32, String> {
    if let Ok(value) = token.parse::<u32>() {
        return Ok(value);
    }
    let lower = token.to_ascii_lowercase();
    names
        .and_then(|(list, offset)| {
            list.iter()
                .position(|n| *n == lower)
                .and_then(|i| u32::try_from(i).ok())
                .map(|i| i + offset)
        })
        .ok_or_else(|| format!("invalid value '{token}'"))
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t).with_minute(0).unwrap_or(t)
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&t.date_naive().and_time(chrono::NaiveTime::MIN))
}

fn start_of_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
        .map(|d| Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| Utc.from_utc_datetime(&d.and_time(chrono::NaiveTime::MIN)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn every_minute() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(
            cron.next_after(at("2026-03-01T10:15:30Z")),
            Some(at("2026-03-01T10:16:00Z"))
        );
    }

    #[test]
    fn daily_at_nine() {
        let cron = CronExpr::parse("0 9 * * *").unwrap();
        assert_eq!(
            cron.next_after(at("2026-03-01T09:00:00Z")),
            Some(at("2026-03-02T09:00:00Z"))
        );
        assert_eq!(
            cron.latest_at_or_before(at("2026-03-01T08:59:59Z")),
            Some(at("2026-02-28T09:00:00Z"))
        );
    }

    #[test]
    fn steps_lists_and_ranges() {
        let cron = CronExpr::parse("*/15 8-10 * * 1,3,5").unwrap();
        // 2026-03-02 is a Monday.
        assert_eq!(
            cron.next_after(at("2026-03-02T10:50:00Z")),
            Some(at("2026-03-04T08:00:00Z"))
        );
        assert!(cron.matches(at("2026-03-02T09:45:00Z")));
        assert!(!cron.matches(at("2026-03-03T09:45:00Z")));
    }

    #[test]
    fn month_rollover_and_names() {
        let cron = CronExpr::parse("30 0 1 jan,JUL *").unwrap();
        assert_eq!(
            cron.next_after(at("2026-03-15T00:00:00Z")),
            Some(at("2026-07-01T00:30:00Z"))
        );
        assert_eq!(
            cron.next_after(at("2026-07-01T00:30:00Z")),
            Some(at("2027-01-01T00:30:00Z"))
        );
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 13th or any Friday.
        let cron = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2026-03-06 is a Friday.
        assert_eq!(
            cron.next_after(at("2026-03-01T00:00:00Z")),
            Some(at("2026-03-06T00:00:00Z"))
        );
        assert!(cron.matches(at("2026-03-13T00:00:00Z")));
    }

    #[test]
    fn stepped_star_day_of_week_stays_unrestricted() {
        // The 1st of a month that falls on Sun, Tue, Thu or Sat.
        let cron = CronExpr::parse("0 0 1 * */2").unwrap();
        assert!(cron.matches(at("2026-03-01T00:00:00Z")));
        // 2026-03-03 is a Tuesday but not the 1st.
        assert!(!cron.matches(at("2026-03-03T00:00:00Z")));
        // April to July start on Wed, Fri, Mon, Wed; August on a Saturday.
        assert_eq!(
            cron.next_after(at("2026-03-01T00:00:00Z")),
            Some(at("2026-08-01T00:00:00Z"))
        );
    }

    #[test]
    fn sunday_as_seven() {
        let cron = CronExpr::parse("0 12 * * 7").unwrap();
        // 2026-03-01 is a Sunday.
        assert!(cron.matches(at("2026-03-01T12:00:00Z")));
    }

    #[test]
    fn aliases() {
        assert_eq!(
            CronExpr::parse("@hourly")
                .unwrap()
                .next_after(at("2026-03-01T10:15:00Z")),
            Some(at("2026-03-01T11:00:00Z"))
        );
        assert_eq!(
            CronExpr::parse("@monthly")
                .unwrap()
                .next_after(at("2026-12-05T00:00:00Z")),
            Some(at("2027-01-01T00:00:00Z"))
        );
        assert!(CronExpr::parse("@weekly").is_ok());
        assert!(CronExpr::parse("@yearly").is_ok());
    }

    #[test]
    fn impossible_date_never_fires() {
        let cron = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at("2026-01-01T00:00:00Z")), None);
    }

    #[test]
    fn latest_crosses_year_boundary() {
        let cron = CronExpr::parse("0 0 25 12 *").unwrap();
        assert_eq!(
            cron.latest_at_or_before(at("2026-03-01T00:00:00Z")),
            Some(at("2025-12-25T00:00:00Z"))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["* * * *", "60 * * * *", "*/0 * * * *", "5-1 * * * *", "x * * * *"] {
            assert!(CronExpr::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
