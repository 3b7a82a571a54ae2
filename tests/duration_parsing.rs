// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Concrete duration-grammar scenarios.

use rufus_rs::{format_duration, parse_duration};

#[test]
fn compound_units_sum_left_to_right() {
    assert_eq!(parse_duration("1y2M3w4d5h6m7s", false).unwrap(), Some(38_898_367.0));
}

#[test]
fn bare_integer_and_float_are_both_seconds() {
    assert_eq!(parse_duration("90", false).unwrap(), Some(90.0));
    assert_eq!(parse_duration("0.25", false).unwrap(), Some(0.25));
}

#[test]
fn negative_sign_applies_to_whole_value() {
    assert_eq!(parse_duration("-2h30m", false).unwrap(), Some(-9_000.0));
}

#[test]
fn rejects_out_of_order_or_duplicate_units_only_if_garbage_remains() {
    // "1h1h" is two valid 1h components back to back - the grammar
    // doesn't forbid repeats, only unrecognised leftover text does.
    assert_eq!(parse_duration("1h1h", false).unwrap(), Some(7_200.0));
    assert!(parse_duration("1hx", false).is_err());
}

#[test]
fn quiet_mode_swallows_errors() {
    assert!(parse_duration("garbage", true).unwrap().is_none());
    assert!(parse_duration("", true).unwrap().is_none());
}

#[test]
fn format_then_parse_round_trips_whole_seconds() {
    for secs in [0, 1, 59, 60, 3_600, 86_400, 604_800, 2_592_000, 31_536_000] {
        let text = format_duration(secs);
        let parsed = parse_duration(&text, false).unwrap().unwrap();
        assert_eq!(parsed as i64, secs, "round-trip failed for {secs} via {text:?}");
    }
}

#[test]
fn format_omits_zero_components() {
    assert_eq!(format_duration(3_600), "1h");
    assert_eq!(format_duration(61), "1m1s");
}
