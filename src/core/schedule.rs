//! Cron schedules for full snapshots.
//!
//! Standard five-field cron expressions (minute, hour, day-of-month,
//! month, day-of-week). The hours field additionally drives the
//! "maximum time window" used by the startup decision: an `*/N` step
//! in the hours field with unrestricted day fields yields a window of
//! N hours, any restricted day-of-week yields a week, and everything
//! else defaults to 24 hours.

use crate::core::error::{TrellisError, TrellisResult};
use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

/// Default full snapshot schedule: once a day at midnight.
pub const DEFAULT_FULL_SNAPSHOT_SCHEDULE: &str = "0 */24 * * *";

/// Default maximum full-snapshot time window in hours.
pub const DEFAULT_FULL_SNAPSHOT_TIME_WINDOW: f64 = 24.0;

const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    spec: String,
    fields: [u64; 5],
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_term(term: &str, min: u32, max: u32) -> Option<u64> {
    let (range, step) = match term.split_once('/') {
        Some((range, step)) => (range, step.parse::<u32>().ok()?),
        None => (term, 1),
    };
    if step == 0 {
        return None;
    }

    let (lo, hi) = if range == "*" {
        (min, max)
    } else if let Some((a, b)) = range.split_once('-') {
        (a.parse().ok()?, b.parse().ok()?)
    } else {
        let v: u32 = range.parse().ok()?;
        // A bare value with a step means "from v to max".
        if step > 1 {
            (v, max)
        } else {
            (v, v)
        }
    };
    if lo < min || hi > max || lo > hi {
        return None;
    }

    let mut mask = 0u64;
    let mut v = lo;
    while v <= hi {
        mask |= 1 << v;
        v += step;
    }
    Some(mask)
}

fn parse_field(text: &str, min: u32, max: u32) -> Option<(u64, bool)> {
    let mut mask = 0u64;
    for term in text.split(',') {
        mask |= parse_term(term, min, max)?;
    }
    Some((mask, text != "*"))
}

impl Schedule {
    /// Parse a standard five-field cron expression.
    pub fn parse(spec: &str) -> TrellisResult<Self> {
        let parts: Vec<&str> = spec.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(TrellisError::configuration(format!(
                "invalid full snapshot schedule {spec:?}: expected 5 fields, got {}",
                parts.len()
            )));
        }

        let mut fields = [0u64; 5];
        let mut restricted = [false; 5];
        for (i, part) in parts.iter().enumerate() {
            let (min, max) = FIELD_RANGES[i];
            let (mask, is_restricted) = parse_field(part, min, max).ok_or_else(|| {
                TrellisError::configuration(format!(
                    "invalid full snapshot schedule {spec:?}: bad field {part:?}"
                ))
            })?;
            fields[i] = mask;
            restricted[i] = is_restricted;
        }

        // Day-of-week 7 is an alias for Sunday.
        if fields[4] & (1 << 7) != 0 {
            fields[4] |= 1;
        }

        Ok(Self {
            spec: spec.to_string(),
            fields,
            dom_restricted: restricted[2],
            dow_restricted: restricted[4],
        })
    }

    /// The original expression text.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        let minute_ok = self.fields[0] & (1 << t.minute()) != 0;
        let hour_ok = self.fields[1] & (1 << t.hour()) != 0;
        let month_ok = self.fields[3] & (1 << t.month()) != 0;

        let dom_ok = self.fields[2] & (1 << t.day()) != 0;
        let dow_ok = self.fields[4] & (1 << t.weekday().num_days_from_sunday()) != 0;
        // Standard cron rule: with both day fields restricted, either
        // may match; otherwise both (wildcards always match).
        let day_ok = if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        };

        minute_ok && hour_ok && month_ok && day_ok
    }

    /// Next fire time strictly after `after`.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after
            .duration_trunc(Duration::minutes(1))
            .ok()?
            + Duration::minutes(1);
        // Cron has minute granularity; a match is guaranteed within a
        // year for any satisfiable expression.
        for _ in 0..(366 * 24 * 60) {
            if self.matches(t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }

    /// Maximum period in hours for which at least one full snapshot
    /// must exist under this schedule.
    pub fn max_time_window(&self) -> f64 {
        let parts: Vec<&str> = self.spec.split_whitespace().collect();
        if parts.len() < 5 {
            return DEFAULT_FULL_SNAPSHOT_TIME_WINDOW;
        }

        if parts[4] != "*" {
            return DEFAULT_FULL_SNAPSHOT_TIME_WINDOW * 7.0;
        }

        if parts[2] == "*" && parts[4] == "*" {
            if let Some(idx) = parts[1].find('/') {
                if let Ok(window) = parts[1][idx + 1..].parse::<f64>() {
                    return window;
                }
            }
        }

        DEFAULT_FULL_SNAPSHOT_TIME_WINDOW
    }

    /// Fire time preceding `next` by one full time window.
    pub fn prev_scheduled_time(next: DateTime<Utc>, time_window_hours: f64) -> DateTime<Utc> {
        next - Duration::seconds((time_window_hours * 3600.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_default_schedule_fires_at_midnight() {
        let schedule = Schedule::parse(DEFAULT_FULL_SNAPSHOT_SCHEDULE).unwrap();
        let next = schedule.next(at(2024, 3, 10, 15, 30)).unwrap();
        assert_eq!(next, at(2024, 3, 11, 0, 0));
    }

    #[test]
    fn test_every_minute() {
        let schedule = Schedule::parse("*/1 * * * *").unwrap();
        let next = schedule.next(at(2024, 3, 10, 15, 30)).unwrap();
        assert_eq!(next, at(2024, 3, 10, 15, 31));
    }

    #[test]
    fn test_hour_step() {
        let schedule = Schedule::parse("0 */6 * * *").unwrap();
        let next = schedule.next(at(2024, 3, 10, 7, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 10, 12, 0));
    }

    #[test]
    fn test_day_of_week_restriction() {
        // Sundays at 02:00. 2024-03-10 is a Sunday.
        let schedule = Schedule::parse("0 2 * * 0").unwrap();
        let next = schedule.next(at(2024, 3, 10, 3, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 17, 2, 0));
    }

    #[test]
    fn test_both_day_fields_restricted_uses_or() {
        // 15th of the month or Mondays. From Sunday 2024-03-10 the
        // next match is Monday 2024-03-11, before the 15th.
        let schedule = Schedule::parse("0 0 15 * 1").unwrap();
        let next = schedule.next(at(2024, 3, 10, 3, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 11, 0, 0));
    }

    #[test]
    fn test_invalid_schedules_rejected() {
        assert!(Schedule::parse("0 2 * *").is_err());
        assert!(Schedule::parse("61 * * * *").is_err());
        assert!(Schedule::parse("0 25 * * *").is_err());
        assert!(Schedule::parse("a b c d e").is_err());
    }

    #[test]
    fn test_time_window_from_hour_step() {
        let schedule = Schedule::parse("0 */6 * * *").unwrap();
        assert_eq!(schedule.max_time_window(), 6.0);
    }

    #[test]
    fn test_time_window_default() {
        let schedule = Schedule::parse("30 14 * * *").unwrap();
        assert_eq!(schedule.max_time_window(), 24.0);
    }

    #[test]
    fn test_time_window_restricted_day_of_week() {
        let schedule = Schedule::parse("0 2 * * 0").unwrap();
        assert_eq!(schedule.max_time_window(), 24.0 * 7.0);
        // Day-of-week restriction wins even over an hour step.
        let schedule = Schedule::parse("0 */6 1 * 3").unwrap();
        assert_eq!(schedule.max_time_window(), 24.0 * 7.0);
    }

    #[test]
    fn test_prev_scheduled_time() {
        let next = at(2024, 3, 11, 0, 0);
        assert_eq!(
            Schedule::prev_scheduled_time(next, 24.0),
            at(2024, 3, 10, 0, 0)
        );
    }
}
