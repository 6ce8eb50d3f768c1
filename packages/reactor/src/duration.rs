//! ISO-8601 durations for interval triggers.

use std::sync::OnceLock;

use chrono::{DateTime, Months, TimeDelta, Utc};
use regex::Regex;

use crate::error::{ReactorError, Result};

fn pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
        )
        .expect("duration pattern is valid")
    })
}

/// A parsed `P[nY][nM][nW][nD][T[nH][nM][nS]]` duration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: f64,
}

impl IsoDuration {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || ReactorError::InvalidInterval(text.to_string());
        let captures = pattern().captures(text).ok_or_else(invalid)?;
        if text == "P" || text.ends_with('T') {
            return Err(invalid());
        }

        let int = |index: usize| -> Result<u32> {
            captures
                .get(index)
                .map(|m| m.as_str().parse::<u32>().map_err(|_| invalid()))
                .unwrap_or(Ok(0))
        };

        Ok(Self {
            years: int(1)?,
            months: int(2)?,
            weeks: int(3)?,
            days: int(4)?,
            hours: int(5)?,
            minutes: int(6)?,
            seconds: captures
                .get(7)
                .map(|m| m.as_str().parse::<f64>().map_err(|_| invalid()))
                .unwrap_or(Ok(0.0))?,
        })
    }

    /// Add this duration to `date`; years and months follow the calendar.
    pub fn add_to(&self, date: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let overflow = || ReactorError::InvalidInterval(format!("{:?} overflows {}", self, date));
        let months = self
            .years
            .checked_mul(12)
            .and_then(|months| months.checked_add(self.months))
            .ok_or_else(overflow)?;
        let date = date
            .checked_add_months(Months::new(months))
            .ok_or_else(overflow)?;

        let millis = (self.seconds * 1000.0).round();
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return Err(overflow());
        }
        let fixed = [
            TimeDelta::try_weeks(i64::from(self.weeks)),
            TimeDelta::try_days(i64::from(self.days)),
            TimeDelta::try_hours(i64::from(self.hours)),
            TimeDelta::try_minutes(i64::from(self.minutes)),
            TimeDelta::try_milliseconds(millis as i64),
        ]
        .into_iter()
        .try_fold(TimeDelta::zero(), |total, part| total.checked_add(&part?))
        .ok_or_else(overflow)?;

        date.checked_add_signed(fixed).ok_or_else(overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_common_intervals() {
        let day = IsoDuration::parse("P1D").unwrap();
        assert_eq!(day.days, 1);

        let mixed = IsoDuration::parse("P1Y2M3DT4H5M6.5S").unwrap();
        assert_eq!(
            (mixed.years, mixed.months, mixed.days, mixed.hours, mixed.minutes),
            (1, 2, 3, 4, 5)
        );
        assert_eq!(mixed.seconds, 6.5);

        assert_eq!(IsoDuration::parse("PT30M").unwrap().minutes, 30);
        assert_eq!(IsoDuration::parse("P2W").unwrap().weeks, 2);
    }

    #[test]
    fn rejects_malformed_intervals() {
        for text in ["", "P", "PT", "1D", "P1H", "every day"] {
            assert!(IsoDuration::parse(text).is_err(), "{} should not parse", text);
        }
    }

    #[test]
    fn months_follow_the_calendar() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let next = IsoDuration::parse("P1M").unwrap().add_to(start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn adds_fixed_parts() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = IsoDuration::parse("P1DT12H").unwrap().add_to(start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn huge_calendar_parts_are_an_error() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let years = IsoDuration::parse("P400000000Y").unwrap();
        assert!(matches!(
            years.add_to(start),
            Err(ReactorError::InvalidInterval(_))
        ));
    }

    #[test]
    fn huge_fixed_parts_are_an_error() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for text in ["P1DT99999999999999999999S", "P4000000000W", "P4000000000D"] {
            let interval = IsoDuration::parse(text).unwrap();
            assert!(
                matches!(interval.add_to(start), Err(ReactorError::InvalidInterval(_))),
                "{} should overflow",
                text
            );
        }
    }
}
