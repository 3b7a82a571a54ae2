// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Absolute-time parser.
//!
//! Accepts an already-absolute instant unchanged, or a string that may
//! contain at most one embedded timezone identifier. The identifier is
//! stripped, the remainder parsed as a naive local date-time, and the
//! result converted to UTC using the recognised zone (or the host's
//! local zone if none is recognised).

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::error::{Result, SchedulerError};

fn tz_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z][A-Za-z0-9\-+]+(?:/[A-Za-z0-9\-+]+)?\b").expect("static regex")
    })
}

/// Common non-IANA abbreviations, resolved to a fixed IANA zone the way
/// most cron/scheduling tools special-case them.
fn abbreviation_to_iana(name: &str) -> Option<&'static str> {
    Some(match name.to_ascii_uppercase().as_str() {
        "UTC" | "GMT" => "UTC",
        "EST" | "EDT" => "America/New_York",
        "CST" | "CDT" => "America/Chicago",
        "MST" | "MDT" => "America/Denver",
        "PST" | "PDT" => "America/Los_Angeles",
        _ => return None,
    })
}

/// The naive date-time formats this parser tries, in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d",
];

/// Parses an absolute-time string into a UTC instant.
///
/// `"2024-06-01 12:00:00 America/Chicago"` strips the embedded zone,
/// parses the remainder as naive local time in that zone, and converts
/// to UTC. `"2024-06-01 12:00:00"` with no recognised zone token is
/// assumed to be in the host's local zone.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SchedulerError::invalid_time_string(input, "empty time string"));
    }

    let (naive_part, zone) = extract_timezone(trimmed);
    let naive_part = naive_part.trim();

    let naive = parse_naive(naive_part)
        .ok_or_else(|| SchedulerError::invalid_time_string(input, "unrecognised date/time format"))?;

    let utc = match zone {
        Some(tz) => local_to_utc(naive, tz),
        None => Local
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| {
                SchedulerError::invalid_time_string(input, "ambiguous or nonexistent local time")
            })?
            .with_timezone(&Utc),
    };

    Ok(utc)
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    // Bare date formats parse to midnight via NaiveDate, not NaiveDateTime.
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is always valid"))
}

fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| {
            // Ambiguous (DST fold) or nonexistent (DST gap): fall back to
            // the earliest matching offset rather than failing outright.
            tz.from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
}

/// Strips at most one timezone token from `input`, returning the
/// remainder and the resolved `Tz` if the token was recognised.
fn extract_timezone(input: &str) -> (String, Option<Tz>) {
    for m in tz_token_re().find_iter(input) {
        let token = m.as_str();
        if let Some(tz) = resolve_zone(token) {
            let mut remainder = String::with_capacity(input.len());
            remainder.push_str(&input[..m.start()]);
            remainder.push_str(&input[m.end()..]);
            return (remainder, Some(tz));
        }
    }
    (input.to_string(), None)
}

fn resolve_zone(token: &str) -> Option<Tz> {
    if let Ok(tz) = Tz::from_str(token) {
        return Some(tz);
    }
    if let Some(iana) = abbreviation_to_iana(token) {
        return Tz::from_str(iana).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_plain_date_time() {
        let parsed = parse_time("2024-06-01 12:00:00 UTC").unwrap();
        assert_eq!(parsed.year(), 2024);
        assert_eq!(parsed.hour(), 12);
    }

    #[test]
    fn parses_embedded_iana_zone() {
        let parsed = parse_time("2024-01-15T09:30:00 America/Chicago").unwrap();
        // Chicago is UTC-6 in January (CST).
        assert_eq!(parsed.hour(), 15);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_time("not a date").is_err());
    }
}
