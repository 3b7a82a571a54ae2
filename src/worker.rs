// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Worker registry and timeout supervision.
//!
//! `std::thread` offers no safe way to interrupt another thread
//! mid-callable, so a timed-out job is not killed: it is left to run to
//! completion while the registry marks it timed out and (per
//! `timeout_reschedule`) the scheduler proceeds as though it had
//! returned. A cooperative `CancelToken` is handed to jobs that want to
//! poll for their own timeout and exit early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::job::JobId;

/// Polled cooperatively by long-running callables to notice their own
/// timeout. Handed to user code via `JobView::cancel_token` for
/// callables willing to check it between steps of a long-running
/// operation; uncooperative code simply never looks at it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        CancelToken { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Identifies one in-flight execution of a job; a periodic job run
/// twice concurrently (two overlapping `Every` firings under
/// non-blocking mode) gets two distinct `WorkerId`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

struct RunningEntry {
    job_id: JobId,
    started_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    token: CancelToken,
    timed_out: bool,
}

/// Tracks every worker currently executing a job's callable, and
/// enforces per-firing timeouts.
pub struct WorkerRegistry {
    next_id: AtomicU64,
    running: Mutex<HashMap<WorkerId, RunningEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            next_id: AtomicU64::new(0),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a newly-started execution, returning its id and a
    /// cancellation token the caller's callable may poll.
    pub fn start(&self, job_id: JobId, started_at: DateTime<Utc>, deadline: Option<DateTime<Utc>>) -> (WorkerId, CancelToken) {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancelToken::new();
        self.running.lock().insert(
            id,
            RunningEntry { job_id, started_at, deadline, token: token.clone(), timed_out: false },
        );
        (id, token)
    }

    /// Removes the entry for a finished execution, returning whether it
    /// had been marked timed out before completing.
    pub fn finish(&self, worker_id: WorkerId) -> bool {
        self.running
            .lock()
            .remove(&worker_id)
            .map(|entry| entry.timed_out)
            .unwrap_or(false)
    }

    /// Signals every currently-running worker's cancel token. Does not
    /// remove entries: workers still
    /// deregister themselves via `finish` on exit.
    pub fn cancel_all(&self) {
        for entry in self.running.lock().values() {
            entry.token.cancel();
        }
    }

    /// Scans every running worker, marking those past their deadline as
    /// timed out and signalling their cancel token. Returns the job ids
    /// that crossed their deadline this sweep (for `timeout_reschedule`
    /// bookkeeping — each job id is reported only once, on the sweep
    /// where it first times out).
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut running = self.running.lock();
        let mut newly_timed_out = Vec::new();
        for entry in running.values_mut() {
            if entry.timed_out {
                continue;
            }
            if let Some(deadline) = entry.deadline {
                if now >= deadline {
                    entry.timed_out = true;
                    entry.token.cancel();
                    newly_timed_out.push(entry.job_id);
                }
            }
        }
        newly_timed_out
    }

    pub fn running_job_ids(&self) -> Vec<JobId> {
        self.running.lock().values().map(|entry| entry.job_id).collect()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.running.lock().values().any(|entry| entry.job_id == job_id)
    }

    pub fn started_at(&self, worker_id: WorkerId) -> Option<DateTime<Utc>> {
        self.running.lock().get(&worker_id).map(|entry| entry.started_at)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use slotmap::SlotMap;

    fn any_job_id() -> JobId {
        let mut map: SlotMap<JobId, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn sweep_reports_each_timeout_once() {
        let registry = WorkerRegistry::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job_id = any_job_id();
        let (worker_id, token) = registry.start(job_id, now, Some(now + chrono::Duration::seconds(5)));

        assert!(registry.sweep_timeouts(now).is_empty());
        assert!(!token.is_cancelled());

        let after = now + chrono::Duration::seconds(10);
        let timed_out = registry.sweep_timeouts(after);
        assert_eq!(timed_out, vec![job_id]);
        assert!(token.is_cancelled());

        assert!(registry.sweep_timeouts(after).is_empty(), "timeout reported only once");
        registry.finish(worker_id);
        assert!(!registry.is_running(job_id));
    }

    #[test]
    fn no_deadline_never_times_out() {
        let registry = WorkerRegistry::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job_id = any_job_id();
        registry.start(job_id, now, None);
        let later = now + chrono::Duration::days(365);
        assert!(registry.sweep_timeouts(later).is_empty());
    }
}
