use crate::config::parse_day;
use crate::constants::DAY_FORMAT;
use crate::error::{CcError, Result};
use crate::Day;
use chrono::Duration;

/// Lists the days from `start` (inclusive) to `end` (exclusive) every `inc_days` days,
/// formatted as `YYYY_MM_DD`.
pub fn day_list(start: &str, end: &str, inc_days: i64) -> Result<Vec<Day>> {
    if inc_days < 1 {
        return Err(CcError::configuration(format!(
            "day increment must be at least 1, got {inc_days}"
        )));
    }
    let start = parse_day(start)?;
    let end = parse_day(end)?;

    let mut days = vec![];
    let mut day = start;
    while day < end {
        days.push(day.format(DAY_FORMAT).to_string());
        day = day + Duration::days(inc_days);
    }

    Ok(days)
}

#[test]
fn test_single_day() {
    assert_eq!(
        day_list("2010_01_01", "2010_01_02", 1).unwrap(),
        vec![String::from("2010_01_01")]
    );
}

#[test]
fn test_crosses_month_and_leap_day() {
    let days = day_list("2012_02_27", "2012_03_02", 1).unwrap();
    assert_eq!(
        days,
        vec!["2012_02_27", "2012_02_28", "2012_02_29", "2012_03_01"]
    );
}

#[test]
fn test_empty_when_end_not_after_start() {
    assert!(day_list("2010_01_02", "2010_01_02", 1).unwrap().is_empty());
}

#[test]
fn test_rejects_bad_input() {
    assert!(day_list("2010-01-01", "2010_01_02", 1).is_err());
    assert!(day_list("2010_01_01", "2010_01_02", 0).is_err());
}
