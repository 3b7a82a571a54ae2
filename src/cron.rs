// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Cron expression parser and next-fire-time computation.
//!
//! Parses a 5-field (`min h dom mon dow`) or 6-field (`sec min h dom mon
//! dow`) cron expression, each field a comma list of literals, inclusive
//! ranges, or step expressions, plus an optional trailing `<Continent>/
//! <City>` (or known abbreviation) timezone token.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};

/// A parsed value-set for one cron field: either "any value matches",
/// or an explicit set of accepted values.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Any,
    Set(BTreeSet<u32>),
}

impl FieldSpec {
    fn matches(&self, value: u32) -> bool {
        match self {
            FieldSpec::Any => true,
            FieldSpec::Set(values) => values.contains(&value),
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, FieldSpec::Any)
    }
}

/// A parsed cron expression, with an optional fixed timezone.
#[derive(Debug, Clone)]
pub struct CronLine {
    raw: String,
    seconds: FieldSpec,
    minutes: FieldSpec,
    hours: FieldSpec,
    days_of_month: FieldSpec,
    months: FieldSpec,
    days_of_week: FieldSpec,
    tz: Option<Tz>,
}

const MAX_SEARCH_ITERATIONS: u32 = 200_000;

impl CronLine {
    /// Parses a 5- or 6-field cron expression, with an optional trailing
    /// timezone token.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(SchedulerError::invalid_cron(expr, "empty cron expression"));
        }

        let mut tokens: Vec<&str> = trimmed.split_whitespace().collect();

        let tz = match tokens.last() {
            Some(last) if tokens.len() > 5 => resolve_zone(last),
            _ => None,
        };
        if tz.is_some() {
            tokens.pop();
        }

        let fields: Vec<&str> = match tokens.len() {
            5 => {
                let mut f = vec!["0"];
                f.extend(tokens);
                f
            }
            6 => tokens,
            n => {
                return Err(SchedulerError::invalid_cron(
                    expr,
                    format!("expected 5 or 6 fields (plus optional timezone), got {n}"),
                ))
            }
        };

        let seconds = parse_field(expr, fields[0], 0, 59, None)?;
        let minutes = parse_field(expr, fields[1], 0, 59, None)?;
        let hours = parse_field(expr, fields[2], 0, 23, None)?;
        let days_of_month = parse_field(expr, fields[3], 1, 31, None)?;
        let months = parse_field(expr, fields[4], 1, 12, Some(MONTH_NAMES))?;
        let days_of_week = parse_field(expr, fields[5], 0, 7, Some(DOW_NAMES))?;

        Ok(CronLine {
            raw: trimmed.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            tz,
        })
    }

    /// The configured timezone, if the expression named one.
    pub fn timezone(&self) -> Option<Tz> {
        self.tz
    }

    /// The original expression text (minus a parsed timezone token).
    pub fn source(&self) -> &str {
        &self.raw
    }

    /// Whether `instant` matches every field of this expression.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        let local = self.to_local(instant);
        self.seconds.matches(local.second())
            && self.minutes.matches(local.minute())
            && self.hours.matches(local.hour())
            && self.day_matches(&local)
            && self.months.matches(local.month())
    }

    /// The smallest instant strictly greater than `from` that matches
    /// every field.
    ///
    /// Works by repeatedly advancing the largest non-matching component
    /// (month, then day, then hour, then minute, then second) and
    /// resetting smaller components to their minimum, which converges in
    /// a bounded number of steps for any satisfiable expression. Bails
    /// out with `InvalidCron` for expressions that can never fire (e.g.
    /// `0 0 30 2 *`).
    pub fn next_time(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut candidate = self
            .to_local(from)
            .with_nanosecond(0)
            .expect("zeroing nanoseconds is always valid")
            + chrono::Duration::seconds(1);

        for _ in 0..MAX_SEARCH_ITERATIONS {
            if !self.months.matches(candidate.month()) {
                candidate = first_of_next_month(candidate);
                continue;
            }
            if !self.day_matches(&candidate) {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if !self.hours.matches(candidate.hour()) {
                candidate = start_of_next_hour(candidate);
                continue;
            }
            if !self.minutes.matches(candidate.minute()) {
                candidate = start_of_next_minute(candidate);
                continue;
            }
            if !self.seconds.matches(candidate.second()) {
                candidate += chrono::Duration::seconds(1);
                continue;
            }
            return Ok(self.to_utc(candidate));
        }

        Err(SchedulerError::invalid_cron(
            &self.raw,
            "no matching instant found within the search horizon (impossible expression?)",
        ))
    }

    /// Day-of-month and day-of-week combine with classic cron OR
    /// semantics: if both fields are restricted, a day matching either
    /// one is accepted; if only one is restricted, only it is checked.
    fn day_matches(&self, local: &NaiveDateTime) -> bool {
        let dom_restricted = !self.days_of_month.is_any();
        let dow_restricted = !self.days_of_week.is_any();

        let dom_ok = self.days_of_month.matches(local.day());
        let weekday = local.weekday().num_days_from_sunday();
        let dow_ok = self.days_of_week.matches(weekday) || self.days_of_week.matches(weekday + 7);

        match (dom_restricted, dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self.tz {
            Some(tz) => instant.with_timezone(&tz).naive_local(),
            None => instant.naive_utc(),
        }
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self.tz {
            Some(tz) => tz
                .from_local_datetime(&local)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| DateTime::<Utc>::from_naive_utc_and_offset(local, Utc)),
            None => DateTime::<Utc>::from_naive_utc_and_offset(local, Utc),
        }
    }
}

impl FromStr for CronLine {
    type Err = SchedulerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CronLine::parse(s)
    }
}

fn first_of_next_month(t: NaiveDateTime) -> NaiveDateTime {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid calendar month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
}

fn start_of_next_day(t: NaiveDateTime) -> NaiveDateTime {
    (t.date() + chrono::Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
}

fn start_of_next_hour(t: NaiveDateTime) -> NaiveDateTime {
    t.date()
        .and_hms_opt(t.hour(), 0, 0)
        .expect("valid time")
        + chrono::Duration::hours(1)
}

fn start_of_next_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.date()
        .and_hms_opt(t.hour(), t.minute(), 0)
        .expect("valid time")
        + chrono::Duration::minutes(1)
}

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const DOW_NAMES: &[(&str, u32)] = &[
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

fn resolve_name(token: &str, names: &[(&str, u32)]) -> Option<u32> {
    let lower = token.to_ascii_lowercase();
    names
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, value)| *value)
}

fn parse_atom(expr: &str, token: &str, min: u32, max: u32, names: Option<&[(&str, u32)]>) -> Result<u32> {
    if let Ok(n) = token.parse::<u32>() {
        if n < min || n > max {
            return Err(SchedulerError::invalid_cron(
                expr,
                format!("value {n} out of range {min}-{max}"),
            ));
        }
        return Ok(n);
    }
    if let Some(names) = names {
        if let Some(n) = resolve_name(token, names) {
            return Ok(n);
        }
    }
    Err(SchedulerError::invalid_cron(
        expr,
        format!("unrecognised field value {token:?}"),
    ))
}

fn parse_field(
    expr: &str,
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[(&str, u32)]>,
) -> Result<FieldSpec> {
    if field == "*" {
        return Ok(FieldSpec::Any);
    }

    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    SchedulerError::invalid_cron(expr, format!("bad step in {part:?}"))
                })?;
                if step == 0 {
                    return Err(SchedulerError::invalid_cron(expr, "step cannot be zero"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((lo_s, hi_s)) = range_part.split_once('-') {
            let lo = parse_atom(expr, lo_s, min, max, names)?;
            let hi = parse_atom(expr, hi_s, min, max, names)?;
            if lo > hi {
                return Err(SchedulerError::invalid_cron(
                    expr,
                    format!("range start {lo} greater than end {hi}"),
                ));
            }
            (lo, hi)
        } else {
            let v = parse_atom(expr, range_part, min, max, names)?;
            (v, v)
        };

        let mut v = lo;
        while v <= hi {
            values.insert(v);
            v += step;
        }
    }

    if values.is_empty() {
        return Err(SchedulerError::invalid_cron(expr, "field matches no values"));
    }

    Ok(FieldSpec::Set(values))
}

fn resolve_zone(token: &str) -> Option<Tz> {
    Tz::from_str(token).ok()
}
