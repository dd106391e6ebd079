//! 5-field cron expressions in named IANA timezones.
//!
//! The `cron` crate wants a seconds field, so the 5-field surface is
//! validated as exactly five whitespace-separated fields and normalised
//! by prepending `0` seconds before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::DelegateError;

/// Validate a 5-field cron expression. Rejected at creation time, so a
/// stored expression is always parseable.
pub fn validate_expression(expr: &str) -> Result<(), DelegateError> {
    parse(expr).map(|_| ())
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, DelegateError> {
    name.parse::<Tz>()
        .map_err(|_| DelegateError::InvalidInput(format!("unknown timezone: {name:?}")))
}

/// The next firing strictly after `after`, evaluated in `tz`.
///
/// `None` when the expression has no future occurrence (possible with
/// fixed year-day combinations that have passed).
pub fn next_occurrence(
    expr: &str,
    tz: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DelegateError> {
    let schedule = parse(expr)?;
    let tz = parse_timezone(tz)?;
    let local_after = after.with_timezone(&tz);
    Ok(schedule
        .after(&local_after)
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}

fn parse(expr: &str) -> Result<Schedule, DelegateError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(DelegateError::InvalidInput(format!(
            "cron expression must have exactly 5 fields, got {}: {expr:?}",
            fields.len()
        )));
    }
    let with_seconds = format!("0 {}", fields.join(" "));
    Schedule::from_str(&with_seconds)
        .map_err(|e| DelegateError::InvalidInput(format!("invalid cron expression {expr:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn accepts_standard_expressions() {
        for expr in ["* * * * *", "0 9 * * 1-5", "*/5 * * * *", "30 2 1 * *"] {
            validate_expression(expr).unwrap_or_else(|e| panic!("{expr} rejected: {e}"));
        }
    }

    #[test]
    fn rejects_wrong_field_counts_and_garbage() {
        for expr in ["* * * *", "* * * * * *", "", "not a cron", "99 * * * *"] {
            assert!(validate_expression(expr).is_err(), "{expr:?} accepted");
        }
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        parse_timezone("UTC").unwrap();
        parse_timezone("Europe/Warsaw").unwrap();
    }

    #[test]
    fn every_minute_advances_to_next_minute_boundary() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 45).unwrap();
        let next = next_occurrence("* * * * *", "UTC", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 31, 0).unwrap());
    }

    #[test]
    fn daily_expression_respects_timezone() {
        // 09:00 in New York is 14:00 UTC in March (EST ends mid-month, use
        // a date before the switch: March 1st is UTC-5).
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let next = next_occurrence("0 9 * * *", "America/New_York", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap());
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn next_is_strictly_after() {
        let boundary = Utc.with_ymd_and_hms(2026, 3, 1, 12, 31, 0).unwrap();
        let next = next_occurrence("* * * * *", "UTC", boundary)
            .unwrap()
            .unwrap();
        assert!(next > boundary);
    }
}
