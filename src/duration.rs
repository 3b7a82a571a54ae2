// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Duration parser and formatter.
//!
//! Grammar: `-? ( NUMBER UNIT )+ | NUMBER`, where `UNIT` is one of
//! `y M w d h m s` (year/month/week/day/hour/minute/second, month
//! approximated as 30 days). A bare `NUMBER` with no unit is seconds,
//! integer or float alike.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, SchedulerError};

const YEAR: f64 = 31_536_000.0;
const MONTH: f64 = 2_592_000.0;
const WEEK: f64 = 604_800.0;
const DAY: f64 = 86_400.0;
const HOUR: f64 = 3_600.0;
const MINUTE: f64 = 60.0;
const SECOND: f64 = 1.0;

fn bare_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(\.\d+)?$").expect("static regex"))
}

fn unit_component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)([yMwdhms])").expect("static regex"))
}

fn unit_seconds(unit: char) -> f64 {
    match unit {
        'y' => YEAR,
        'M' => MONTH,
        'w' => WEEK,
        'd' => DAY,
        'h' => HOUR,
        'm' => MINUTE,
        's' => SECOND,
        _ => unreachable!("unit_component_re only matches known units"),
    }
}

/// Parses a compact duration string into a second count.
///
/// `quiet` controls failure handling: on parse failure, `quiet` returns
/// `Ok(None)` instead of an error.
pub fn parse_duration(input: &str, quiet: bool) -> Result<Option<f64>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return fail(input, "empty duration string", quiet);
    }

    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    if body.is_empty() {
        return fail(input, "no digits after sign", quiet);
    }

    let sign = if negative { -1.0 } else { 1.0 };

    if bare_number_re().is_match(body) {
        let value: f64 = body
            .parse()
            .map_err(|_| SchedulerError::invalid_duration(input, "not a number"))?;
        return Ok(Some(sign * value));
    }

    let re = unit_component_re();
    let mut total = 0.0_f64;
    let mut consumed = 0usize;
    let mut any = false;
    for caps in re.captures_iter(body) {
        let whole = caps.get(0).expect("group 0 always present");
        if whole.start() != consumed {
            return fail(input, "unrecognised characters in duration", quiet);
        }
        let number: f64 = caps[1]
            .parse()
            .map_err(|_| SchedulerError::invalid_duration(input, "not a number"))?;
        let unit = caps[2].chars().next().expect("unit is one char");
        total += number * unit_seconds(unit);
        consumed = whole.end();
        any = true;
    }

    if !any || consumed != body.len() {
        return fail(input, "does not match the duration grammar", quiet);
    }

    Ok(Some(sign * total))
}

fn fail(input: &str, reason: &str, quiet: bool) -> Result<Option<f64>> {
    if quiet {
        Ok(None)
    } else {
        Err(SchedulerError::invalid_duration(input, reason))
    }
}

/// Formats a whole second count as the canonical compact duration string.
///
/// Greedily decomposes into the largest units first, omitting zero
/// components. `format_duration(0)` is `"0s"`.
pub fn format_duration(total_seconds: i64) -> String {
    if total_seconds == 0 {
        return "0s".to_string();
    }

    let negative = total_seconds < 0;
    let mut remaining = total_seconds.unsigned_abs();

    const UNITS: [(&str, u64); 7] = [
        ("y", YEAR as u64),
        ("M", MONTH as u64),
        ("w", WEEK as u64),
        ("d", DAY as u64),
        ("h", HOUR as u64),
        ("m", MINUTE as u64),
        ("s", SECOND as u64),
    ];

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    for (suffix, unit_secs) in UNITS {
        let count = remaining / unit_secs;
        if count > 0 {
            out.push_str(&count.to_string());
            out.push_str(suffix);
            remaining -= count * unit_secs;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1w2d", false).unwrap(), Some(777_600.0));
        assert_eq!(parse_duration("1h10s", false).unwrap(), Some(3_610.0));
    }

    #[test]
    fn parses_negative_duration() {
        assert_eq!(parse_duration("-1h", false).unwrap(), Some(-3_600.0));
        assert_eq!(parse_duration("-0.5", false).unwrap(), Some(-0.5));
    }

    #[test]
    fn bare_integer_is_seconds() {
        assert_eq!(parse_duration("500", false).unwrap(), Some(500.0));
    }

    #[test]
    fn rejects_garbage_unless_quiet() {
        assert!(parse_duration("not-a-duration", false).is_err());
        assert_eq!(parse_duration("not-a-duration", true).unwrap(), None);
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(format_duration(3_661), "1h1m1s");
        assert_eq!(format_duration(7 * 24 * 3_600), "1w");
        assert_eq!(format_duration(0), "0s");
    }

    #[test]
    fn round_trips_integer_seconds() {
        for secs in [1, 61, 3_661, 90_061, 604_800, 777_600] {
            let formatted = format_duration(secs);
            let parsed = parse_duration(&formatted, false).unwrap().unwrap();
            assert_eq!(parsed as i64, secs);
        }
    }
}
