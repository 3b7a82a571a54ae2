// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Concrete cron-grammar scenarios.

use chrono::TimeZone;
use rufus_rs::CronLine;

#[test]
fn five_field_every_five_minutes_advances_in_five_minute_steps() {
    let line = CronLine::parse("*/5 * * * *").unwrap();
    let from = chrono::Utc.with_ymd_and_hms(2024, 3, 10, 23, 58, 0).unwrap();
    let next = line.next_time(from).unwrap();
    assert_eq!(next, chrono::Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
}

#[test]
fn six_field_adds_seconds_precision() {
    let line = CronLine::parse("30 * * * * *").unwrap();
    let from = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let next = line.next_time(from).unwrap();
    assert_eq!(next, chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap());
}

#[test]
fn day_of_month_and_day_of_week_combine_with_or_when_both_restricted() {
    // Fires on the 1st of the month OR any Friday.
    let line = CronLine::parse("0 0 1 * Fri").unwrap();
    let friday_not_first = chrono::Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
    assert!(line.matches(friday_not_first));
    // April 1st, 2024 is a Monday.
    let first_not_friday = chrono::Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
    assert!(line.matches(first_not_friday));
    let neither = chrono::Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap();
    assert!(!line.matches(neither));
}

#[test]
fn unrestricted_day_fields_match_every_day() {
    let line = CronLine::parse("0 12 * * *").unwrap();
    let noon = chrono::Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap();
    assert!(line.matches(noon));
}

#[test]
fn named_months_and_weekdays_parse() {
    let line = CronLine::parse("0 0 9 * Jan,Jul Mon-Fri").unwrap();
    let monday_in_january = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    assert!(line.matches(monday_in_january));
    let monday_in_march = chrono::Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
    assert!(!line.matches(monday_in_march));
}

#[test]
fn impossible_date_never_resolves() {
    // February never has a 30th.
    let line = CronLine::parse("0 0 0 30 2 *").unwrap();
    let from = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    assert!(line.next_time(from).is_err());
}

#[test]
fn embedded_timezone_shifts_the_matched_instant() {
    let line = CronLine::parse("0 0 9 * * * America/Chicago").unwrap();
    // 09:00 CST (UTC-6) in January is 15:00 UTC.
    let fifteen_utc = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap();
    assert!(line.matches(fifteen_utc));
    let nine_utc = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
    assert!(!line.matches(nine_utc));
}

#[test]
fn rejects_malformed_expressions() {
    assert!(CronLine::parse("").is_err());
    assert!(CronLine::parse("* * * *").is_err());
    assert!(CronLine::parse("60 * * * *").is_err());
    assert!(CronLine::parse("1-60 * * * *").is_err());
}
