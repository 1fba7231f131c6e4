//! Calendar-day helpers shared by the driver, the checkpoint store, and the CLI.

use chrono::{Days, NaiveDate, NaiveDateTime};

use crate::core::errors::{AvlError, Result};

/// Format used for day stamps in file names and checkpoints.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Format of UTC check timestamps in checkpoints and output tables.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a `YYYY-MM-DD` day stamp.
pub fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DAY_FORMAT).map_err(|error| AvlError::DateRange {
        details: format!("can't parse {raw:?}, should be yyyy-mm-dd: {error}"),
    })
}

/// Inclusive range of days from `start` to `end` (defaults to `start`).
pub fn day_range(start: NaiveDate, end: Option<NaiveDate>) -> Result<Vec<NaiveDate>> {
    let end = end.unwrap_or(start);
    if end < start {
        return Err(AvlError::DateRange {
            details: format!("end date {end} is before start date {start}"),
        });
    }
    Ok(start.iter_days().take_while(|day| *day <= end).collect())
}

/// The calendar day after `day`, saturating at the end of chrono's range.
#[must_use]
pub fn next_day(day: NaiveDate) -> NaiveDate {
    day.checked_add_days(Days::new(1)).unwrap_or(day)
}

/// `day` shifted back by `days`, saturating at the start of chrono's range.
#[must_use]
pub fn days_before(day: NaiveDate, days: u64) -> NaiveDate {
    day.checked_sub_days(Days::new(days)).unwrap_or(day)
}

#[must_use]
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD HH:MM:SS` UTC timestamp.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

/// `YYYYMMDD` form used by the univaf snapshot file names.
#[must_use]
pub fn compact_stamp(day: NaiveDate) -> String {
    day.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(raw: &str) -> NaiveDate {
        parse_day(raw).expect("valid day")
    }

    #[test]
    fn range_is_inclusive() {
        let days = day_range(d("2021-05-30"), Some(d("2021-06-02"))).unwrap();
        let stamps: Vec<String> = days.iter().map(ToString::to_string).collect();
        assert_eq!(
            stamps,
            ["2021-05-30", "2021-05-31", "2021-06-01", "2021-06-02"]
        );
    }

    #[test]
    fn missing_end_is_single_day() {
        let days = day_range(d("2021-05-01"), None).unwrap();
        assert_eq!(days, vec![d("2021-05-01")]);
    }

    #[test]
    fn reversed_range_rejected() {
        let err = day_range(d("2021-05-02"), Some(d("2021-05-01"))).unwrap_err();
        assert_eq!(err.code(), "AVL-1004");
    }

    #[test]
    fn bad_day_rejected() {
        assert!(parse_day("05/01/2021").is_err());
        assert!(parse_day("2021-02-30").is_err());
    }

    #[test]
    fn day_arithmetic_crosses_month_boundaries() {
        assert_eq!(next_day(d("2021-02-28")), d("2021-03-01"));
        assert_eq!(days_before(d("2021-03-01"), 1), d("2021-02-28"));
        assert_eq!(compact_stamp(d("2021-03-01")), "20210301");
    }

    #[test]
    fn timestamps_round_trip_at_second_precision() {
        let ts = parse_timestamp("2021-05-01 09:00:07").unwrap();
        assert_eq!(format_timestamp(ts), "2021-05-01 09:00:07");
        assert!(parse_timestamp("2021-05-01T09:00:07").is_none());
    }
}
