//! Business calendar used for timer arithmetic.
//!
//! The scheduler only ever asks three questions: what does an end-date string
//! mean, when is the next firing of a recurrence, and is a due date still
//! inside the timer's window. [`CycleBusinessCalendar`] answers them for
//! ISO-8601 repeating intervals (`PT1H`, `<start>/P1D`, `P1W/<end>`) and for
//! cron rules (`0 0/5 * * * ?`).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Months, NaiveDateTime, Utc};
use thiserror::Error;

use jobforge_core::Clock;

use crate::jobs::recurrence::{Iterations, Recurrence};

/// Safety cap on stepping through a cycle.
const MAX_CYCLE_STEPS: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("invalid date '{0}'")]
    InvalidDate(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("unsupported cycle rule '{0}'")]
    UnsupportedRule(String),
    #[error("invalid cron rule '{rule}': {reason}")]
    InvalidCron { rule: String, reason: String },
    #[error("cron rule '{0}' has no upcoming firing")]
    NoUpcomingFiring(String),
    #[error("date arithmetic overflow")]
    Overflow,
}

/// Timer arithmetic collaborator.
pub trait BusinessCalendar: Send + Sync {
    /// Parse an end date given as text.
    fn resolve_end_date(&self, text: &str) -> Result<DateTime<Utc>, CalendarError>;

    /// Next due date of a recurrence, relative to the calendar's clock.
    fn resolve_due_date(
        &self,
        recurrence: &Recurrence,
        max_iterations: Iterations,
    ) -> Result<DateTime<Utc>, CalendarError>;

    /// Whether `due_date` still falls inside the timer's window.
    fn validate_due_date(
        &self,
        recurrence: Option<&Recurrence>,
        max_iterations: Iterations,
        end_date: Option<DateTime<Utc>>,
        due_date: DateTime<Utc>,
    ) -> Result<bool, CalendarError>;
}

/// An ISO-8601 duration split into calendar months and exact time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDuration {
    pub months: u32,
    pub exact: Duration,
}

impl IsoDuration {
    pub fn parse(text: &str) -> Result<Self, CalendarError> {
        let invalid = || CalendarError::InvalidDuration(text.to_string());
        let body = text.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }

        let (date_part, time_part) = match body.split_once('T') {
            Some((d, t)) if !t.is_empty() => (d, Some(t)),
            Some(_) => return Err(invalid()),
            None => (body, None),
        };

        let mut months: u32 = 0;
        let mut exact = Duration::zero();
        let mut number = String::new();

        for c in date_part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let n: i64 = number.parse().map_err(|_| invalid())?;
            number.clear();
            match c {
                'Y' | 'M' => {
                    let added = if c == 'Y' { n.checked_mul(12) } else { Some(n) };
                    months = added
                        .and_then(|m| u32::try_from(m).ok())
                        .and_then(|m| months.checked_add(m))
                        .ok_or_else(invalid)?;
                }
                'W' => exact = add_exact(exact, Duration::try_weeks(n)).ok_or_else(invalid)?,
                'D' => exact = add_exact(exact, Duration::try_days(n)).ok_or_else(invalid)?,
                _ => return Err(invalid()),
            }
        }
        if !number.is_empty() {
            return Err(invalid());
        }

        if let Some(time) = time_part {
            for c in time.chars() {
                if c.is_ascii_digit() {
                    number.push(c);
                    continue;
                }
                let n: i64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let part = match c {
                    'H' => Duration::try_hours(n),
                    'M' => Duration::try_minutes(n),
                    'S' => Duration::try_seconds(n),
                    _ => return Err(invalid()),
                };
                exact = add_exact(exact, part).ok_or_else(invalid)?;
            }
            if !number.is_empty() {
                return Err(invalid());
            }
        }

        if months == 0 && exact.is_zero() {
            return Err(invalid());
        }
        Ok(Self { months, exact })
    }

    pub fn add_to(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, CalendarError> {
        let shifted = at
            .checked_add_months(Months::new(self.months))
            .ok_or(CalendarError::Overflow)?;
        shifted
            .checked_add_signed(self.exact)
            .ok_or(CalendarError::Overflow)
    }
}

fn add_exact(total: Duration, part: Option<Duration>) -> Option<Duration> {
    total.checked_add(&part?)
}

/// The interval part of a recurrence: `<duration>`, `<start>/<duration>` or
/// `<duration>/<end>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRule {
    pub start: Option<DateTime<Utc>>,
    pub period: IsoDuration,
    pub end: Option<DateTime<Utc>>,
}

impl CycleRule {
    pub fn parse(rule: &str) -> Result<Self, CalendarError> {
        let parts: Vec<&str> = rule.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [period] => Ok(Self {
                start: None,
                period: IsoDuration::parse(period)?,
                end: None,
            }),
            [first, second] if first.starts_with('P') => Ok(Self {
                start: None,
                period: IsoDuration::parse(first)?,
                end: Some(parse_date(second)?),
            }),
            [first, second] => Ok(Self {
                start: Some(parse_date(first)?),
                period: IsoDuration::parse(second)?,
                end: None,
            }),
            _ => Err(CalendarError::UnsupportedRule(rule.to_string())),
        }
    }

    /// End of the window spanned by `iterations` periods from the start.
    fn window_end(&self, iterations: Iterations) -> Result<Option<DateTime<Utc>>, CalendarError> {
        let (Some(start), Iterations::Bounded(n)) = (self.start, iterations) else {
            return Ok(None);
        };
        let mut at = start;
        for _ in 0..n.min(MAX_CYCLE_STEPS) {
            at = self.period.add_to(at)?;
        }
        Ok(Some(at))
    }
}

/// A cron rule. Five-field rules get a leading seconds field; six and seven
/// field (Quartz style, with `?` and an optional year) rules are used as is.
#[derive(Debug, Clone)]
pub struct CronRule {
    rule: String,
    schedule: cron::Schedule,
}

impl CronRule {
    /// Whether a recurrence rule is written in cron syntax rather than as an
    /// ISO-8601 interval.
    pub fn is_cron(rule: &str) -> bool {
        rule.split_whitespace().count() > 1
    }

    pub fn parse(rule: &str) -> Result<Self, CalendarError> {
        let trimmed = rule.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_string(),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| CalendarError::InvalidCron {
            rule: rule.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            rule: trimmed.to_string(),
            schedule,
        })
    }

    /// First firing strictly after `at`.
    pub fn next_after(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, CalendarError> {
        self.schedule
            .after(&at)
            .next()
            .ok_or_else(|| CalendarError::NoUpcomingFiring(self.rule.clone()))
    }
}

/// Parse an ISO-8601 date-time; naive values are read as UTC.
pub fn parse_date(text: &str) -> Result<DateTime<Utc>, CalendarError> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| CalendarError::InvalidDate(text.to_string()))
}

/// Calendar for ISO-8601 repeating intervals and cron rules.
#[derive(Clone)]
pub struct CycleBusinessCalendar {
    clock: Arc<dyn Clock>,
}

impl CycleBusinessCalendar {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl std::fmt::Debug for CycleBusinessCalendar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleBusinessCalendar").finish_non_exhaustive()
    }
}

impl BusinessCalendar for CycleBusinessCalendar {
    fn resolve_end_date(&self, text: &str) -> Result<DateTime<Utc>, CalendarError> {
        parse_date(text)
    }

    fn resolve_due_date(
        &self,
        recurrence: &Recurrence,
        max_iterations: Iterations,
    ) -> Result<DateTime<Utc>, CalendarError> {
        let now = self.clock.now();
        if CronRule::is_cron(recurrence.rule()) {
            return CronRule::parse(recurrence.rule())?.next_after(now);
        }
        let rule = CycleRule::parse(recurrence.rule())?;

        let Some(start) = rule.start else {
            return rule.period.add_to(now);
        };
        if start > now {
            return Ok(start);
        }

        let limit = max_iterations.as_option().unwrap_or(MAX_CYCLE_STEPS).min(MAX_CYCLE_STEPS);
        let mut at = start;
        let mut steps = 0;
        while at <= now && steps < limit {
            at = rule.period.add_to(at)?;
            steps += 1;
        }
        Ok(at)
    }

    fn validate_due_date(
        &self,
        recurrence: Option<&Recurrence>,
        max_iterations: Iterations,
        end_date: Option<DateTime<Utc>>,
        due_date: DateTime<Utc>,
    ) -> Result<bool, CalendarError> {
        if let Some(end) = end_date {
            return Ok(due_date <= end);
        }

        let Some(recurrence) = recurrence else {
            return Ok(true);
        };
        if CronRule::is_cron(recurrence.rule()) {
            // Only an end date bounds a cron rule.
            CronRule::parse(recurrence.rule())?;
            return Ok(true);
        }
        let rule = CycleRule::parse(recurrence.rule())?;
        if let Some(end) = rule.end {
            return Ok(due_date <= end);
        }
        match rule.window_end(max_iterations)? {
            Some(window_end) => Ok(due_date <= window_end),
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobforge_core::ManualClock;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, day, hour, 0, 0).unwrap()
    }

    fn calendar_at(now: DateTime<Utc>) -> CycleBusinessCalendar {
        CycleBusinessCalendar::new(Arc::new(ManualClock::new(now)))
    }

    #[test]
    fn parses_iso_durations() {
        let d = IsoDuration::parse("P1DT2H30M").unwrap();
        assert_eq!(d.months, 0);
        assert_eq!(d.exact, Duration::days(1) + Duration::hours(2) + Duration::minutes(30));

        let m = IsoDuration::parse("P1Y2M").unwrap();
        assert_eq!(m.months, 14);

        assert!(IsoDuration::parse("PT").is_err());
        assert!(IsoDuration::parse("1H").is_err());
        assert!(IsoDuration::parse("P0D").is_err());
    }

    #[test]
    fn next_due_is_one_period_from_now() {
        let calendar = calendar_at(at(1, 10));
        let recurrence: Recurrence = "R3/PT1H".parse().unwrap();
        let due = calendar.resolve_due_date(&recurrence, Iterations::Bounded(3)).unwrap();
        assert_eq!(due, at(1, 11));
    }

    #[test]
    fn next_due_with_start_steps_past_now() {
        let calendar = calendar_at(at(3, 12));
        let recurrence: Recurrence = "R/2026-05-01T00:00:00Z/P1D".parse().unwrap();
        let due = calendar.resolve_due_date(&recurrence, Iterations::Unbounded).unwrap();
        assert_eq!(due, at(4, 0));
    }

    #[test]
    fn end_date_closes_the_window() {
        let calendar = calendar_at(at(1, 0));
        let recurrence: Recurrence = "R/PT1H".parse().unwrap();
        let end = Some(at(1, 5));

        assert!(calendar.validate_due_date(Some(&recurrence), Iterations::Unbounded, end, at(1, 5)).unwrap());
        assert!(!calendar.validate_due_date(Some(&recurrence), Iterations::Unbounded, end, at(1, 6)).unwrap());
    }

    #[test]
    fn bounded_cycle_with_start_closes_after_n_periods() {
        let calendar = calendar_at(at(1, 0));
        let recurrence: Recurrence = "R2/2026-05-01T00:00:00Z/PT1H".parse().unwrap();

        assert!(calendar.validate_due_date(Some(&recurrence), Iterations::Bounded(2), None, at(1, 2)).unwrap());
        assert!(!calendar.validate_due_date(Some(&recurrence), Iterations::Bounded(2), None, at(1, 3)).unwrap());
    }

    #[test]
    fn one_shot_timers_are_always_valid_without_end_date() {
        let calendar = calendar_at(at(1, 0));
        assert!(calendar.validate_due_date(None, Iterations::Bounded(1), None, at(20, 0)).unwrap());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        for text in ["PT9999999999999H", "P9999999999999W", "P999999999999D", "P999999999Y", "P4294967295M1M"] {
            assert_eq!(
                IsoDuration::parse(text),
                Err(CalendarError::InvalidDuration(text.to_string())),
                "{text}"
            );
        }
    }

    #[test]
    fn oversized_cycle_fails_to_resolve() {
        let calendar = calendar_at(at(1, 10));
        let recurrence: Recurrence = "R/PT9999999999999H".parse().unwrap();
        assert!(matches!(
            calendar.resolve_due_date(&recurrence, Iterations::Unbounded),
            Err(CalendarError::InvalidDuration(_))
        ));
    }

    #[test]
    fn cron_rules_resolve_to_the_next_firing() {
        let calendar = calendar_at(Utc.with_ymd_and_hms(2026, 5, 1, 10, 7, 30).unwrap());

        let quartz: Recurrence = "0 0/5 * * * ?".parse().unwrap();
        let due = calendar.resolve_due_date(&quartz, Iterations::Unbounded).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2026, 5, 1, 10, 10, 0).unwrap());

        let unix: Recurrence = "0 12 * * *".parse().unwrap();
        let due = calendar.resolve_due_date(&unix, Iterations::Unbounded).unwrap();
        assert_eq!(due, at(1, 12));
    }

    #[test]
    fn cron_rules_are_bounded_by_the_end_date_only() {
        let calendar = calendar_at(at(1, 0));
        let recurrence: Recurrence = "0 0 * * * ?".parse().unwrap();

        assert!(calendar.validate_due_date(Some(&recurrence), Iterations::Unbounded, None, at(30, 0)).unwrap());
        assert!(!calendar.validate_due_date(Some(&recurrence), Iterations::Unbounded, Some(at(2, 0)), at(3, 0)).unwrap());
    }

    #[test]
    fn malformed_cron_rules_are_rejected() {
        let calendar = calendar_at(at(1, 0));
        let recurrence: Recurrence = "0 61 * * * ?".parse().unwrap();
        assert!(matches!(
            calendar.resolve_due_date(&recurrence, Iterations::Unbounded),
            Err(CalendarError::InvalidCron { .. })
        ));
        assert!(CronRule::is_cron("0 0/5 * * * ?"));
        assert!(!CronRule::is_cron("2026-05-01T00:00:00Z/PT1H"));
    }

    #[test]
    fn resolves_end_dates_in_both_formats() {
        let calendar = calendar_at(at(1, 0));
        assert_eq!(calendar.resolve_end_date("2026-05-02T00:00:00Z").unwrap(), at(2, 0));
        assert_eq!(calendar.resolve_end_date("2026-05-02T00:00:00").unwrap(), at(2, 0));
        assert!(calendar.resolve_end_date("next tuesday").is_err());
    }
}
