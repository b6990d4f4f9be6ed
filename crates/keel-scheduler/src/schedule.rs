//! Cron expressions.
//!
//! Expressions use the Quartz layout: seconds, minutes, hours, day of month,
//! month, day of week and an optional year.

use chrono::{DateTime, Utc};
use keel_core::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    /// Validate and parse `expression`.
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let fields = expression.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            return Err(invalid(format!("expected 6 or 7 fields, found {}", fields)));
        }

        let schedule = cron::Schedule::from_str(expression).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    /// First fire time strictly after `after`, if the schedule has one.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wrong_field_count_rejected() {
        let err = CronExpression::parse("* * * *").unwrap_err();
        assert!(matches!(err, Error::InvalidCron { ref expression, .. } if expression == "* * * *"));
        assert!(CronExpression::parse("0 * * * *").is_err());
    }

    #[test]
    fn test_bad_field_rejected() {
        assert!(CronExpression::parse("0 61 * * * *").is_err());
    }

    #[test]
    fn test_next_after() {
        let expr = CronExpression::parse("0 30 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        assert_eq!(
            expr.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 2, 30, 0).unwrap())
        );

        let later = Utc.with_ymd_and_hms(2024, 3, 1, 2, 30, 0).unwrap();
        assert_eq!(
            expr.next_after(later),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 2, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_year_field_accepted() {
        let expr = CronExpression::parse("0 0 12 1 1 * 2030").unwrap();
        assert_eq!(expr.as_str(), "0 0 12 1 1 * 2030");
    }
}
