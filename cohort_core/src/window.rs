//! Windows expressed as day offsets from a patient's index date.

use crate::{CohortMember, Error, IndexedMember, Result};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive window `[index + from_days, index + to_days]`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelativeWindow {
    pub from_days: i64,
    pub to_days: i64,
}

impl RelativeWindow {
    /// Build a window, rejecting inverted bounds
    pub fn new(from_days: i64, to_days: i64) -> Result<Self> {
        if from_days > to_days {
            return Err(Error::invalid(format!(
                "window start ({}) is after window end ({})",
                from_days, to_days
            )));
        }
        Ok(Self { from_days, to_days })
    }

    /// Absolute window for one member
    ///
    /// Fails with [`Error::InvalidArgument`] when an offset moves the index
    /// date outside the representable calendar.
    pub fn resolve(&self, member: &IndexedMember) -> Result<CohortMember> {
        let shift = |days: i64| {
            Duration::try_days(days)
                .and_then(|offset| member.index_date.checked_add_signed(offset))
                .ok_or_else(|| {
                    Error::invalid(format!(
                        "offset {} days from index date {} of patient {} is out of range",
                        days, member.index_date, member.patient_id
                    ))
                })
        };
        Ok(CohortMember::new(
            member.patient_id,
            shift(self.from_days)?,
            shift(self.to_days)?,
        ))
    }

    /// Whether `date` falls inside the window anchored at `index_date`
    pub fn contains(&self, index_date: NaiveDate, date: NaiveDate) -> bool {
        let offset = (date - index_date).num_days();
        self.from_days <= offset && offset <= self.to_days
    }
}

impl fmt::Display for RelativeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from_days, self.to_days)
    }
}

/// Parses `FROM:TO`, e.g. `-14:365`
impl FromStr for RelativeWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once(':')
            .ok_or_else(|| Error::invalid(format!("window '{}' must look like FROM:TO", s)))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| Error::invalid(format!("window bound '{}' is not an integer", part)))
        };
        RelativeWindow::new(parse(from)?, parse(to)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PatientId;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        assert!(matches!(
            RelativeWindow::new(10, -10),
            Err(Error::InvalidArgument(_))
        ));
        assert!(RelativeWindow::new(0, 0).is_ok());
    }

    #[test]
    fn test_resolve_to_absolute_period() {
        let window = RelativeWindow::new(-14, 365).unwrap();
        let member = IndexedMember {
            patient_id: PatientId(4),
            index_date: date(2022, 1, 15),
        };

        let period = window.resolve(&member).unwrap();
        assert_eq!(period.patient_id, PatientId(4));
        assert_eq!(period.start_date, date(2022, 1, 1));
        assert_eq!(period.end_date, date(2023, 1, 15));
        assert_eq!(period.period_days(), 380);
    }

    #[test]
    fn test_resolve_rejects_out_of_range_offsets() {
        let member = IndexedMember {
            patient_id: PatientId(4),
            index_date: date(2022, 1, 15),
        };

        let window = RelativeWindow::new(-1_000_000_000, 0).unwrap();
        assert!(matches!(window.resolve(&member), Err(Error::InvalidArgument(_))));

        let window = RelativeWindow::new(0, i64::MAX).unwrap();
        assert!(matches!(window.resolve(&member), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_contains_is_inclusive() {
        let window = RelativeWindow::new(-1, 2).unwrap();
        let index = date(2023, 3, 10);
        assert!(!window.contains(index, date(2023, 3, 8)));
        assert!(window.contains(index, date(2023, 3, 9)));
        assert!(window.contains(index, date(2023, 3, 12)));
        assert!(!window.contains(index, date(2023, 3, 13)));
    }

    #[test]
    fn test_parse_from_str() {
        let window: RelativeWindow = "-14:365".parse().unwrap();
        assert_eq!(
            window,
            RelativeWindow {
                from_days: -14,
                to_days: 365
            }
        );
        assert!("14".parse::<RelativeWindow>().is_err());
        assert!("a:b".parse::<RelativeWindow>().is_err());
        assert!("5:1".parse::<RelativeWindow>().is_err());
    }
}
