// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! The scheduler: public API + tick loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};

use crate::cron::CronLine;
use crate::error::{Result, SchedulerError};
use crate::job::{secs_to_duration, Callable, Job, JobId, JobKind, JobOpts, JobSnapshot, JobView, TimeoutSpec};
use crate::job_array::JobArray;
use crate::log::{sched_debug, sched_error, sched_info, sched_warn};
use crate::mutex_registry::MutexRegistry;
use crate::worker::WorkerRegistry;

const DEFAULT_FREQUENCY_SECS: f64 = 0.3;

/// Tunables for a `Scheduler`.
pub struct SchedulerOpts {
    frequency_secs: f64,
    on_error: Option<Arc<dyn Fn(JobView, SchedulerError) + Send + Sync>>,
}

impl SchedulerOpts {
    pub fn new() -> Self {
        SchedulerOpts { frequency_secs: DEFAULT_FREQUENCY_SECS, on_error: None }
    }

    /// The tick period. Periodic jobs with a shorter intrinsic period
    /// are rejected at scheduling time.
    pub fn frequency(mut self, secs: f64) -> Self {
        self.frequency_secs = secs;
        self
    }

    /// Overrides the default no-op `on_error(job, error)` hook, called
    /// whenever a worker panics or times out.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(JobView, SchedulerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl Default for SchedulerOpts {
    fn default() -> Self {
        Self::new()
    }
}

/// How `Scheduler::shutdown` should treat in-flight workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop the loop thread; in-flight workers are left to finish on
    /// their own, unobserved.
    Immediate,
    /// Stop the loop thread and block until `running_jobs` is empty.
    Wait,
    /// Stop the loop thread, signal every running worker's cancel
    /// token, and block until `running_jobs` is empty.
    Kill,
}

/// Filters jobs enumerated by `Scheduler::jobs` and its `*_jobs`
/// siblings: optionally by whether a worker is currently running the
/// job, and/or by a required set of tags.
#[derive(Default, Clone)]
pub struct JobFilter {
    running: Option<bool>,
    tags: HashSet<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(mut self, running: bool) -> Self {
        self.running = Some(running);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// The result of a scheduling call: always an id, plus a snapshot when
/// `JobOpts::as_job(true)` was requested.
///
/// `Job` owns a boxed callable and is not `Clone`, so it cannot be
/// handed out by value while still owned by the `JobArray`.
/// `JobSnapshot` is the read-only stand-in.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub id: JobId,
    pub snapshot: Option<JobSnapshot>,
}

struct Shared {
    jobs: JobArray,
    mutexes: MutexRegistry,
    workers: WorkerRegistry,
    frequency: f64,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    wake_lock: Mutex<()>,
    wake_condvar: Condvar,
    on_error: Arc<dyn Fn(JobView, SchedulerError) + Send + Sync>,
}

impl Shared {
    fn wake(&self) {
        let _guard = self.wake_lock.lock();
        self.wake_condvar.notify_all();
    }
}

/// Owns the job store, the tick loop thread, the named-mutex registry,
/// and the running-workers registry.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Builds and starts a scheduler: spawns its tick-loop thread
    /// immediately, the way the teacher's `Scheduler::<Tz>::launch`
    /// starts its driving future as soon as it's constructed.
    pub fn launch(opts: SchedulerOpts) -> Self {
        let now = Utc::now();
        let shared = Arc::new(Shared {
            jobs: JobArray::new(),
            mutexes: MutexRegistry::new(),
            workers: WorkerRegistry::new(),
            frequency: opts.frequency_secs,
            paused: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            started_at: Mutex::new(Some(now)),
            wake_lock: Mutex::new(()),
            wake_condvar: Condvar::new(),
            on_error: opts.on_error.unwrap_or_else(|| Arc::new(|_, _| {})),
        });

        let loop_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("rufus-scheduler".into())
            .spawn(move || run_loop(loop_shared))
            .expect("failed to spawn scheduler loop thread");

        sched_info!("scheduler launched, frequency={}s", shared.frequency);
        Scheduler { shared, thread: Mutex::new(Some(handle)) }
    }

    /// Schedules a job that fires once at `time`.
    pub fn at(&self, time: DateTime<Utc>, callable: Callable, opts: JobOpts) -> Result<Scheduled> {
        self.schedule(JobKind::At { at: time }, opts, format!("at {time}"), callable)
    }

    /// Schedules a job that fires once after `delay_secs` (named `in_`
    /// because `in` is a reserved word).
    pub fn in_(&self, delay_secs: f64, callable: Callable, opts: JobOpts) -> Result<Scheduled> {
        self.schedule(JobKind::In { delay_secs }, opts, format!("in {delay_secs}s"), callable)
    }

    /// Schedules a job that fires every `frequency_secs`. Rejected if
    /// `frequency_secs` is shorter than the scheduler's own tick
    /// frequency.
    pub fn every(&self, frequency_secs: f64, callable: Callable, opts: JobOpts) -> Result<Scheduled> {
        if frequency_secs < self.shared.frequency {
            return Err(SchedulerError::invalid_argument(format!(
                "period {frequency_secs}s is shorter than the scheduler's tick frequency {}s",
                self.shared.frequency
            )));
        }
        self.schedule(JobKind::Every { frequency_secs }, opts, format!("every {frequency_secs}s"), callable)
    }

    /// Schedules a job on a cron expression.
    pub fn cron(&self, expr: &str, callable: Callable, opts: JobOpts) -> Result<Scheduled> {
        let line = CronLine::parse(expr)?;
        self.schedule(JobKind::Cron { line }, opts, expr.to_string(), callable)
    }

    fn schedule(&self, kind: JobKind, opts: JobOpts, original_spec: String, callable: Callable) -> Result<Scheduled> {
        let as_job = opts.as_job;
        let now = Utc::now();
        let id = self.shared.jobs.try_push(|| Job::new(kind, opts, original_spec, callable, now))?;
        let snapshot = if as_job { self.shared.jobs.lookup(id) } else { None };
        sched_debug!("scheduled job {id}");
        Ok(Scheduled { id, snapshot })
    }

    /// Marks a job for removal on the next sweep.
    pub fn unschedule(&self, id: JobId) -> Result<()> {
        let now = Utc::now();
        self.shared
            .jobs
            .with_job_mut(id, |job| job.mark_unscheduled(now))
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        Ok(())
    }

    /// Enumerates jobs matching `filter`.
    pub fn jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.shared
            .jobs
            .to_a()
            .into_iter()
            .filter(|snapshot| filter.tags.iter().all(|tag| snapshot.tags.contains(tag)))
            .filter(|snapshot| {
                filter.running.map_or(true, |want| self.shared.workers.is_running(snapshot.id) == want)
            })
            .collect()
    }

    fn jobs_of_kind(&self, kind_label: &str, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.jobs(filter).into_iter().filter(|snapshot| snapshot.kind_label == kind_label).collect()
    }

    pub fn at_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.jobs_of_kind("at", filter)
    }

    pub fn in_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.jobs_of_kind("in", filter)
    }

    pub fn every_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.jobs_of_kind("every", filter)
    }

    pub fn cron_jobs(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        self.jobs_of_kind("cron", filter)
    }

    /// Jobs with a worker currently executing them.
    pub fn running_jobs(&self) -> Vec<JobSnapshot> {
        self.jobs(&JobFilter::new().running(true))
    }

    /// O(1) lookup by id, backed by the slotmap.
    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.shared.jobs.lookup(id)
    }

    /// Stops triggering due jobs; the loop keeps advancing time,
    /// sweeping unscheduled jobs, and enforcing timeouts.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resumes triggering.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Stops the loop thread.
    pub fn shutdown(&self, mode: ShutdownMode) {
        sched_info!("shutdown requested: {mode:?}");
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wake();

        if mode == ShutdownMode::Kill {
            self.shared.workers.cancel_all();
        }
        if mode != ShutdownMode::Immediate {
            self.wait_for_running_to_drain();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Unschedules every job, then waits until no worker is running.
    pub fn terminate_all_jobs(&self) {
        let now = Utc::now();
        for snapshot in self.shared.jobs.to_a() {
            let _ = self.shared.jobs.with_job_mut(snapshot.id, |job| job.mark_unscheduled(now));
        }
        self.wait_for_running_to_drain();
    }

    fn wait_for_running_to_drain(&self) {
        while !self.shared.workers.running_job_ids().is_empty() {
            thread::sleep(Duration::from_secs_f64(self.shared.frequency));
        }
    }

    /// How long the scheduler has been running, or `None` once stopped.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.shared.started_at.lock().map(|started_at| Utc::now() - started_at)
    }

    /// `uptime` as a float second count.
    pub fn uptime_s(&self) -> Option<f64> {
        self.uptime().map(|duration| duration.num_milliseconds() as f64 / 1000.0)
    }

    /// Blocks until the loop thread exits.
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }

        let now = Utc::now();
        let swept = shared.jobs.delete_unscheduled();
        if !swept.is_empty() {
            sched_debug!("swept {} unscheduled job(s)", swept.len());
        }

        if !shared.paused.load(Ordering::Acquire) {
            while let Some(id) = shared.jobs.shift(now) {
                trigger(&shared, id, now);
            }
        }

        for job_id in shared.workers.sweep_timeouts(now) {
            sched_warn!("job {job_id} exceeded its timeout");
        }

        let mut guard = shared.wake_lock.lock();
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
        shared.wake_condvar.wait_for(&mut guard, Duration::from_secs_f64(shared.frequency));
    }

    shared.started_at.lock().take();
    sched_info!("scheduler loop exited");
}

/// Pulls a due job's callable out, then either runs it inline
/// (`blocking`) or hands it to a fresh worker thread.
fn trigger(shared: &Arc<Shared>, id: JobId, now: DateTime<Utc>) {
    let extracted = shared.jobs.with_stored_job_mut(id, |job| {
        let view = job.view(id);
        let scheduled_time = job.next_time().unwrap_or(now);
        let callable = std::mem::replace(job.callable_mut(), Callable::Arity0(Box::new(|| {})));
        (callable, view, scheduled_time, job.is_blocking(), job.mutex_names().to_vec(), job.timeout(), job.timeout_reschedule())
    });

    let Some((callable, view, scheduled_time, blocking, mutex_names, timeout, timeout_reschedule)) = extracted else {
        return;
    };

    if blocking {
        run_worker(shared, id, callable, view, scheduled_time, mutex_names, timeout, timeout_reschedule, now);
    } else {
        let shared = shared.clone();
        thread::spawn(move || {
            run_worker(&shared, id, callable, view, scheduled_time, mutex_names, timeout, timeout_reschedule, now);
        });
    }
}

fn run_worker(
    shared: &Arc<Shared>,
    id: JobId,
    mut callable: Callable,
    view: JobView,
    scheduled_time: DateTime<Utc>,
    mutex_names: Vec<String>,
    timeout: Option<TimeoutSpec>,
    timeout_reschedule: bool,
    trigger_time: DateTime<Utc>,
) {
    let started_at = Utc::now();
    let deadline = timeout.map(|spec| match spec {
        TimeoutSpec::At(at) => at,
        TimeoutSpec::After(secs) => started_at + secs_to_duration(secs),
    });
    let (worker_id, token) = shared.workers.start(id, started_at, deadline);

    let guards = (!mutex_names.is_empty()).then(|| shared.mutexes.acquire_all(&mutex_names));

    let mut invoke_view = view.clone();
    invoke_view.cancel_token = token;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callable.invoke(invoke_view, scheduled_time, trigger_time);
    }));

    drop(guards);
    // Measured after the callable returns, not at the fire instant: an
    // Every job's next occurrence is scheduled relative to when this run
    // finished, so two runs of the same non-blocking job can never
    // overlap no matter how long the callable takes.
    let fired_at = Utc::now();
    let timed_out = shared.workers.finish(worker_id);

    if timed_out {
        (shared.on_error)(view.clone(), SchedulerError::TimeoutError);
    }
    if let Err(panic) = result {
        let message = panic_message(panic);
        sched_error!("job {id} panicked: {message}");
        (shared.on_error)(view.clone(), SchedulerError::CallbackError(message));
    }

    shared.jobs.with_stored_job_mut(id, |job| {
        *job.callable_mut() = callable;
        if timed_out && !timeout_reschedule {
            job.mark_unscheduled(fired_at);
        } else {
            job.postfire(fired_at, scheduled_time);
        }
    });
    shared.jobs.settle_after_trigger(id);
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job callable panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    #[test]
    fn in_job_fires_once() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.02));
        let (tx, rx) = mpsc::channel();
        scheduler
            .in_(0.05, Callable::Arity0(Box::new(move || tx.send(()).unwrap())), JobOpts::new())
            .unwrap();

        rx.recv_timeout(Duration::from_secs(2)).expect("job should fire");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "one-shot job must not refire");
    }

    #[test]
    fn every_job_respects_times_limit() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.02));
        let count = Arc::new(AtomicU32::new(0));
        let counted = count.clone();
        scheduler
            .every(
                0.03,
                Callable::Arity0(Box::new(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })),
                JobOpts::new().times(3),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(600));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn every_rejects_period_shorter_than_frequency() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(1.0));
        let result = scheduler.every(0.1, Callable::Arity0(Box::new(|| {})), JobOpts::new());
        assert!(matches!(result, Err(SchedulerError::InvalidArgument { .. })));
    }

    #[test]
    fn unschedule_removes_job_on_next_sweep() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.02));
        let scheduled = scheduler
            .at(Utc::now() + chrono::Duration::seconds(60), Callable::Arity0(Box::new(|| {})), JobOpts::new())
            .unwrap();

        scheduler.unschedule(scheduled.id).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(scheduler.job(scheduled.id).is_none());
    }

    #[test]
    fn mutex_option_serialises_overlapping_every_jobs() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.02));
        let concurrent = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let concurrent = concurrent.clone();
            let violations = violations.clone();
            scheduler
                .every(
                    0.03,
                    Callable::Arity0(Box::new(move || {
                        if concurrent.swap(true, Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(40));
                        concurrent.store(false, Ordering::SeqCst);
                    })),
                    JobOpts::new().mutex(["m"]).times(3),
                )
                .unwrap();
        }

        thread::sleep(Duration::from_millis(700));
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn timeout_reports_to_on_error_hook() {
        let reported = Arc::new(AtomicBool::new(false));
        let flag = reported.clone();
        let scheduler = Scheduler::launch(
            SchedulerOpts::new().frequency(0.02).on_error(move |_job, error| {
                if matches!(error, SchedulerError::TimeoutError) {
                    flag.store(true, Ordering::SeqCst);
                }
            }),
        );

        scheduler
            .in_(
                0.01,
                Callable::Arity0(Box::new(|| thread::sleep(Duration::from_millis(300)))),
                JobOpts::new().timeout(TimeoutSpec::After(0.05)),
            )
            .unwrap();

        thread::sleep(Duration::from_millis(500));
        assert!(reported.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_wait_drains_running_jobs() {
        let scheduler = Scheduler::launch(SchedulerOpts::new().frequency(0.02));
        scheduler
            .in_(0.01, Callable::Arity0(Box::new(|| thread::sleep(Duration::from_millis(150)))), JobOpts::new())
            .unwrap();

        thread::sleep(Duration::from_millis(60));
        scheduler.shutdown(ShutdownMode::Wait);
        assert!(scheduler.running_jobs().is_empty());
    }
}
