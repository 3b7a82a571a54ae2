// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! An in-process job scheduler: schedule callables to run at an
//! absolute instant, after a delay, on a fixed interval, or on a cron
//! expression.
//!
//! - **Thread-based**: one dedicated loop thread drives scheduling
//!   decisions; each non-blocking firing runs on its own worker thread.
//! - **Cron Expressions**: a 5- or 6-field parser with named day/month
//!   literals and an optional embedded IANA timezone.
//! - **Tags, pausing, timeouts, named mutexes**: jobs can be grouped by
//!   tag, paused without stopping the loop, given a deadline enforced
//!   by a timeout supervisor, and serialised against one another via
//!   shared named mutexes.
//!
//! # Example
//!
//! ```no_run
//! use rufus_rs::{Callable, JobOpts, Scheduler, SchedulerOpts};
//!
//! let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.1));
//!
//! // Fires once, 200ms from now.
//! let fizz = scheduler
//!     .in_(0.2, Callable::Arity0(Box::new(|| println!("Fizz"))), JobOpts::new())
//!     .unwrap();
//!
//! // Fires every 3 seconds, tagged for later lookup.
//! let buzz = scheduler
//!     .every(
//!         3.0,
//!         Callable::Arity0(Box::new(|| println!("Buzz"))),
//!         JobOpts::new().tags(["demo"]),
//!     )
//!     .unwrap();
//!
//! scheduler.unschedule(fizz.id).unwrap();
//! scheduler.unschedule(buzz.id).unwrap();
//! ```

use chrono::{DateTime, TimeZone};

mod cron;
mod duration;
mod error;
mod job;
mod job_array;
mod log;
mod mutex_registry;
mod scheduler;
mod time;
mod worker;

pub use self::cron::CronLine;
pub use self::duration::{format_duration, parse_duration};
pub use self::error::{Result, SchedulerError};
pub use self::job::*;
pub use self::scheduler::*;
pub use self::time::parse_time;
pub use self::worker::CancelToken;

/// Extensions for the chrono timezone structs.
///
/// Kept from the crate's original single-Future design, generalised
/// here to cover any `chrono_tz::Tz` in addition to `Local`/`Utc`, for
/// callers who want to format scheduled times in a job's own zone.
pub trait TimeZoneExt: TimeZone + Copy + Clone {
    /// Constructs a default timezone struct for this timezone.
    fn timescale() -> Self;

    /// Get the current time in this timezone.
    fn now() -> DateTime<Self>;
}

impl TimeZoneExt for chrono::Local {
    fn timescale() -> Self {
        Self
    }
    fn now() -> DateTime<Self> {
        Self::now()
    }
}

impl TimeZoneExt for chrono::Utc {
    fn timescale() -> Self {
        Self
    }

    fn now() -> DateTime<Self> {
        Self::now()
    }
}

impl TimeZoneExt for chrono_tz::Tz {
    fn timescale() -> Self {
        chrono_tz::UTC
    }

    fn now() -> DateTime<Self> {
        chrono::Utc::now().with_timezone(&Self::timescale())
    }
}
