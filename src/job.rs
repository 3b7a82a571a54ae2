// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Job model and lifecycle.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use slotmap::{new_key_type, Key};

use crate::cron::CronLine;
use crate::error::Result;
use crate::worker::CancelToken;

new_key_type! {
    /// Opaque job identifier, unique per scheduler instance.
    ///
    /// Backed by `slotmap` for O(1) generational lookup; `Display`
    /// renders a stable string so callers that want an opaque string id
    /// get one from `job_id.to_string()`.
    pub struct JobId;
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.data().as_ffi())
    }
}

/// A read-only, cheaply-cloneable view of a job, handed to callables
/// that ask for it (arity 1, 2, or 3). Kept separate from the live
/// `Job` so that user code never needs to hold the scheduler's
/// internal locks.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: JobId,
    pub tags: HashSet<String>,
    pub original_spec: String,
    pub scheduled_at: DateTime<Utc>,
    pub count: u64,
    /// Signalled when this firing is timed out or killed. Long-running
    /// callables may poll `is_cancelled()` between steps; nothing
    /// forces them to.
    pub cancel_token: CancelToken,
}

/// The callable payload, dispatched according to its declared arity.
/// A small closed enum rather than general reflection.
pub enum Callable {
    Arity0(Box<dyn FnMut() + Send>),
    Arity1(Box<dyn FnMut(JobView) + Send>),
    Arity2(Box<dyn FnMut(JobView, DateTime<Utc>) + Send>),
    Arity3(Box<dyn FnMut(JobView, DateTime<Utc>, DateTime<Utc>) + Send>),
}

impl Callable {
    pub(crate) fn invoke(&mut self, view: JobView, scheduled_time: DateTime<Utc>, now: DateTime<Utc>) {
        match self {
            Callable::Arity0(f) => f(),
            Callable::Arity1(f) => f(view),
            Callable::Arity2(f) => f(view, scheduled_time),
            Callable::Arity3(f) => f(view, scheduled_time, now),
        }
    }
}

/// A timeout spec: either a fixed deadline or a duration measured from
/// the worker's start.
#[derive(Debug, Clone, Copy)]
pub enum TimeoutSpec {
    At(DateTime<Utc>),
    After(f64),
}

/// The temporal variant a job was scheduled as.
pub enum JobKind {
    At { at: DateTime<Utc> },
    In { delay_secs: f64 },
    Every { frequency_secs: f64 },
    Cron { line: CronLine },
}

impl JobKind {
    pub(crate) fn is_periodic(&self) -> bool {
        matches!(self, JobKind::Every { .. } | JobKind::Cron { .. })
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            JobKind::At { .. } => "at",
            JobKind::In { .. } => "in",
            JobKind::Every { .. } => "every",
            JobKind::Cron { .. } => "cron",
        }
    }
}

/// A cheap, cloneable enumeration-friendly summary of a job, used by
/// the scheduler's job-listing and lookup methods.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub tags: HashSet<String>,
    pub original_spec: String,
    pub next_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub unscheduled_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub count: u64,
    pub kind_label: &'static str,
}

/// Scheduling options recognised on a job.
#[derive(Clone, Default)]
pub struct JobOpts {
    pub(crate) tags: HashSet<String>,
    pub(crate) mutex_names: Vec<String>,
    pub(crate) blocking: bool,
    pub(crate) timeout: Option<TimeoutSpec>,
    pub(crate) timeout_reschedule: bool,
    pub(crate) first_at: Option<DateTime<Utc>>,
    pub(crate) first_in: Option<f64>,
    pub(crate) last_at: Option<DateTime<Utc>>,
    pub(crate) last_in: Option<f64>,
    pub(crate) times: Option<u64>,
    pub(crate) discard_past: bool,
    pub(crate) as_job: bool,
}

impl JobOpts {
    pub fn new() -> Self {
        Self {
            timeout_reschedule: true,
            ..Default::default()
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn mutex<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutex_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether a timed-out periodic job still reschedules. Defaults to
    /// `true`.
    pub fn timeout_reschedule(mut self, reschedule: bool) -> Self {
        self.timeout_reschedule = reschedule;
        self
    }

    pub fn first_at(mut self, at: DateTime<Utc>) -> Self {
        self.first_at = Some(at);
        self
    }

    pub fn first_in(mut self, secs: f64) -> Self {
        self.first_in = Some(secs);
        self
    }

    /// After this instant, a periodic job fires no more.
    pub fn last_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_at = Some(at);
        self
    }

    /// Like `last_at`, but measured from the moment the job is
    /// scheduled rather than as a fixed instant.
    pub fn last_in(mut self, secs: f64) -> Self {
        self.last_in = Some(secs);
        self
    }

    pub fn times(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    pub fn discard_past(mut self, discard: bool) -> Self {
        self.discard_past = discard;
        self
    }

    /// Request a snapshot of the `Job` back from a scheduling call,
    /// alongside its id.
    pub fn as_job(mut self, as_job: bool) -> Self {
        self.as_job = as_job;
        self
    }
}

/// A scheduled unit of work.
///
/// Does not carry its own id: the slotmap key handed out by
/// `JobArray` on insertion *is* the job's identity, so every API that
/// needs both passes `(JobId, &Job)` (or `&mut Job`) together rather
/// than duplicating the id inside the struct.
pub struct Job {
    kind: JobKind,
    opts: JobOpts,
    original_spec: String,
    callable: Callable,
    next_time: Option<DateTime<Utc>>,
    last_time: Option<DateTime<Utc>>,
    scheduled_at: DateTime<Utc>,
    unscheduled_at: Option<DateTime<Utc>>,
    paused: bool,
    count: u64,
    /// `last_at`, or `last_in` resolved to a fixed instant at
    /// construction time. Kept separate from `opts` so `last_in` is
    /// only ever measured once, against the job's `scheduled_at`.
    last_bound: Option<DateTime<Utc>>,
}

pub(crate) fn secs_to_duration(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
}

impl Job {
    pub(crate) fn new(
        kind: JobKind,
        opts: JobOpts,
        original_spec: String,
        callable: Callable,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let next_time = initial_next_time(&kind, &opts, now)?;
        let last_bound = opts.last_at.or_else(|| opts.last_in.map(|secs| now + secs_to_duration(secs)));

        let exhausted_before_first_fire =
            kind.is_periodic() && (opts.times == Some(0) || last_bound.is_some_and(|bound| next_time > bound));

        let mut job = Job {
            kind,
            opts,
            original_spec,
            callable,
            next_time: Some(next_time),
            last_time: None,
            scheduled_at: now,
            unscheduled_at: None,
            paused: false,
            count: 0,
            last_bound,
        };

        if exhausted_before_first_fire {
            job.next_time = None;
            job.mark_unscheduled(now);
        }

        Ok(job)
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn opts(&self) -> &JobOpts {
        &self.opts
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.opts.tags
    }

    pub fn original_spec(&self) -> &str {
        &self.original_spec
    }

    pub fn next_time(&self) -> Option<DateTime<Utc>> {
        self.next_time
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last_time
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn unscheduled_at(&self) -> Option<DateTime<Utc>> {
        self.unscheduled_at
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_unscheduled(&self) -> bool {
        self.unscheduled_at.is_some()
    }

    pub fn is_blocking(&self) -> bool {
        self.opts.blocking
    }

    pub fn mutex_names(&self) -> &[String] {
        &self.opts.mutex_names
    }

    pub fn timeout(&self) -> Option<TimeoutSpec> {
        self.opts.timeout
    }

    pub fn timeout_reschedule(&self) -> bool {
        self.opts.timeout_reschedule
    }

    pub(crate) fn view(&self, id: JobId) -> JobView {
        JobView {
            id,
            tags: self.opts.tags.clone(),
            original_spec: self.original_spec.clone(),
            scheduled_at: self.scheduled_at,
            cancel_token: CancelToken::new(),
            count: self.count,
        }
    }

    /// A cheap, cloneable summary for enumeration APIs.
    pub fn snapshot(&self, id: JobId) -> JobSnapshot {
        JobSnapshot {
            id,
            tags: self.opts.tags.clone(),
            original_spec: self.original_spec.clone(),
            next_time: self.next_time,
            last_time: self.last_time,
            scheduled_at: self.scheduled_at,
            unscheduled_at: self.unscheduled_at,
            paused: self.paused,
            count: self.count,
            kind_label: self.kind.label(),
        }
    }

    pub(crate) fn callable_mut(&mut self) -> &mut Callable {
        &mut self.callable
    }

    /// Marks the job for removal on the next sweep.
    pub(crate) fn mark_unscheduled(&mut self, at: DateTime<Utc>) {
        if self.unscheduled_at.is_none() {
            self.unscheduled_at = Some(at);
        }
    }

    /// Applies the post-fire reschedule rule.
    ///
    /// Returns the new `next_time` if the job should stay in the
    /// `JobArray`, or `None` if it's exhausted (one-shot fired, or a
    /// periodic job that hit `last_at`/`last_in`/`times`/an
    /// unsatisfiable cron).
    pub(crate) fn postfire(&mut self, fired_at: DateTime<Utc>, scheduled_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_time = Some(scheduled_time);
        self.count += 1;

        match &self.kind {
            JobKind::At { .. } | JobKind::In { .. } => {
                self.mark_unscheduled(fired_at);
                self.next_time = None;
                None
            }
            JobKind::Every { frequency_secs } => {
                let next = fired_at + secs_to_duration(*frequency_secs);
                self.apply_periodic_limits(next)
            }
            JobKind::Cron { line } => match line.next_time(fired_at) {
                Ok(next) => self.apply_periodic_limits(next),
                Err(_) => {
                    self.mark_unscheduled(fired_at);
                    self.next_time = None;
                    None
                }
            },
        }
    }

    fn apply_periodic_limits(&mut self, next: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(last_bound) = self.last_bound {
            if next > last_bound {
                self.mark_unscheduled(next);
                self.next_time = None;
                return None;
            }
        }
        if let Some(times) = self.opts.times {
            if self.count >= times {
                self.mark_unscheduled(next);
                self.next_time = None;
                return None;
            }
        }
        self.next_time = Some(next);
        Some(next)
    }
}

fn initial_next_time(kind: &JobKind, opts: &JobOpts, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let natural = match kind {
        JobKind::At { at } => *at,
        JobKind::In { delay_secs } => now + secs_to_duration(*delay_secs),
        JobKind::Every { frequency_secs } => now + secs_to_duration(*frequency_secs),
        JobKind::Cron { line } => line.next_time(now)?,
    };

    // `first_at`/`first_in` only force the *initial* fire of a periodic
    // job; At/In jobs already name their one instant.
    let forced = if kind.is_periodic() {
        if let Some(at) = opts.first_at {
            Some(at)
        } else {
            opts.first_in.map(|secs| now + secs_to_duration(secs))
        }
    } else {
        None
    };

    let mut chosen = forced.unwrap_or(natural);

    if chosen <= now && opts.discard_past {
        chosen = match kind {
            JobKind::Every { frequency_secs } => now + secs_to_duration(*frequency_secs),
            JobKind::Cron { line } => line.next_time(now)?,
            _ => chosen,
        };
    }

    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noop() -> Callable {
        Callable::Arity0(Box::new(|| {}))
    }

    #[test]
    fn every_job_reschedules_after_fire() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut job = Job::new(
            JobKind::Every { frequency_secs: 10.0 },
            JobOpts::new(),
            "every 10s".into(),
            noop(),
            now,
        )
        .unwrap();

        assert_eq!(job.next_time(), Some(now + chrono::Duration::seconds(10)));
        let fired_at = now + chrono::Duration::seconds(10);
        let next = job.postfire(fired_at, fired_at);
        assert_eq!(next, Some(fired_at + chrono::Duration::seconds(10)));
        assert_eq!(job.count(), 1);
    }

    #[test]
    fn times_limit_exhausts_job() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut job = Job::new(
            JobKind::Every { frequency_secs: 1.0 },
            JobOpts::new().times(2),
            "every 1s".into(),
            noop(),
            now,
        )
        .unwrap();

        let t1 = job.next_time().unwrap();
        assert!(job.postfire(t1, t1).is_some());
        let t2 = job.next_time().unwrap();
        assert!(job.postfire(t2, t2).is_none());
        assert!(job.is_unscheduled());
    }

    #[test]
    fn at_job_unschedules_after_firing() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let at = now + chrono::Duration::seconds(5);
        let mut job = Job::new(JobKind::At { at }, JobOpts::new(), "at".into(), noop(), now).unwrap();

        assert_eq!(job.next_time(), Some(at));
        assert!(job.postfire(at, at).is_none());
        assert!(job.is_unscheduled());
    }

    #[test]
    fn last_at_limit_exhausts_periodic_job() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut job = Job::new(
            JobKind::Every { frequency_secs: 10.0 },
            JobOpts::new().last_at(now + chrono::Duration::seconds(15)),
            "every 10s".into(),
            noop(),
            now,
        )
        .unwrap();

        let t1 = job.next_time().unwrap();
        assert!(job.postfire(t1, t1).is_some());
        let t2 = job.next_time().unwrap();
        assert!(job.postfire(t2, t2).is_none());
    }

    #[test]
    fn times_zero_never_fires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = Job::new(
            JobKind::Every { frequency_secs: 1.0 },
            JobOpts::new().times(0),
            "every 1s".into(),
            noop(),
            now,
        )
        .unwrap();

        assert!(job.next_time().is_none());
        assert!(job.is_unscheduled());
        assert_eq!(job.count(), 0);
    }

    #[test]
    fn last_at_already_past_never_fires() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = Job::new(
            JobKind::Every { frequency_secs: 10.0 },
            JobOpts::new().last_at(now - chrono::Duration::seconds(1)),
            "every 10s".into(),
            noop(),
            now,
        )
        .unwrap();

        assert!(job.next_time().is_none());
        assert!(job.is_unscheduled());
        assert_eq!(job.count(), 0);
    }

    #[test]
    fn last_in_bounds_periodic_job_like_last_at() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut job = Job::new(
            JobKind::Every { frequency_secs: 10.0 },
            JobOpts::new().last_in(15.0),
            "every 10s".into(),
            noop(),
            now,
        )
        .unwrap();

        let t1 = job.next_time().unwrap();
        assert!(job.postfire(t1, t1).is_some());
        let t2 = job.next_time().unwrap();
        assert!(job.postfire(t2, t2).is_none(), "last_in(15s) should exhaust the job after t=20s");
    }
}
