// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Thread-safe, `next_time`-ordered job store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::error::Result;
use crate::job::{Job, JobId, JobSnapshot};

struct Inner {
    storage: SlotMap<JobId, Job>,
    /// Ids in ascending order of `storage[id].next_time()`. Every id in
    /// `order` has a `Some` `next_time`; no id appears twice
    /// (guaranteed by each id being a distinct slotmap key).
    order: Vec<JobId>,
}

impl Inner {
    fn next_time_of(&self, id: JobId) -> DateTime<Utc> {
        self.storage[id]
            .next_time()
            .expect("jobs present in `order` always have a next_time")
    }

    fn insert_sorted(&mut self, id: JobId) {
        let next_time = self.next_time_of(id);
        let pos = self
            .order
            .partition_point(|existing| self.next_time_of(*existing) <= next_time);
        self.order.insert(pos, id);
    }

    fn remove_from_order(&mut self, id: JobId) {
        if let Some(pos) = self.order.iter().position(|existing| *existing == id) {
            self.order.remove(pos);
        }
    }
}

/// A thread-safe priority structure over jobs, keyed by `next_time`.
pub struct JobArray {
    inner: Mutex<Inner>,
}

impl JobArray {
    pub fn new() -> Self {
        JobArray {
            inner: Mutex::new(Inner {
                storage: SlotMap::with_key(),
                order: Vec::new(),
            }),
        }
    }

    /// Builds and inserts a job in one critical section, at the
    /// position determined by binary search on `next_time`. The
    /// builder receives the id its job will be stored under, so
    /// callables can close over it if needed.
    ///
    /// A job built already exhausted (e.g. `times(0)`, or a `last_at`
    /// bound already in the past) is stored but left out of `order`,
    /// so it is never handed out by `shift` and is swept away by the
    /// next `delete_unscheduled`.
    pub fn try_push<F>(&self, build: F) -> Result<JobId>
    where
        F: FnOnce() -> Result<Job>,
    {
        let job = build()?;
        let mut inner = self.inner.lock();
        let id = inner.storage.insert(job);
        if inner.storage[id].next_time().is_some() {
            inner.insert_sorted(id);
        }
        Ok(id)
    }

    /// Bulk push under a single critical section.
    pub fn concat(&self, jobs: Vec<Job>) {
        let mut inner = self.inner.lock();
        for job in jobs {
            let id = inner.storage.insert(job);
            if inner.storage[id].next_time().is_some() {
                inner.insert_sorted(id);
            }
        }
    }

    /// If the earliest job is due, removes and returns its id. Callers
    /// loop until `None`.
    pub fn shift(&self, now: DateTime<Utc>) -> Option<JobId> {
        let mut inner = self.inner.lock();
        let earliest = *inner.order.first()?;
        if inner.next_time_of(earliest) > now {
            return None;
        }
        inner.order.remove(0);
        Some(earliest)
    }

    /// Runs `f` against the job with the given id, re-sorting its
    /// position afterward (its `next_time` may have changed). Returns
    /// `None` if the id is unknown.
    pub fn with_job_mut<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        let result = f(inner.storage.get_mut(id)?);
        inner.remove_from_order(id);
        if inner.storage[id].next_time().is_some() {
            inner.insert_sorted(id);
        }
        Some(result)
    }

    /// Mutates a stored job without touching its position in `order`.
    ///
    /// Used mid-trigger: the job has already been removed from `order`
    /// by `shift` (so it isn't handed out twice while its callable
    /// runs), but is still present in `storage`. Pair with
    /// `settle_after_trigger` once the firing completes.
    pub fn with_stored_job_mut<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        Some(f(inner.storage.get_mut(id)?))
    }

    /// Re-inserts a job into `order` if it still has a `next_time`
    /// (i.e. `postfire` rescheduled it) after a trigger completes. A
    /// job left without a `next_time` stays in `storage` until the next
    /// `delete_unscheduled` sweep picks it up.
    pub fn settle_after_trigger(&self, id: JobId) {
        let mut inner = self.inner.lock();
        if inner.storage.get(id).and_then(Job::next_time).is_some() {
            inner.insert_sorted(id);
        }
    }

    /// Removes every job marked unscheduled, returning ids removed.
    pub fn delete_unscheduled(&self) -> Vec<JobId> {
        let mut inner = self.inner.lock();
        let to_remove: Vec<JobId> = inner
            .storage
            .iter()
            .filter(|(_, job)| job.is_unscheduled())
            .map(|(id, _)| id)
            .collect();
        for id in &to_remove {
            inner.remove_from_order(*id);
            inner.storage.remove(*id);
        }
        to_remove
    }

    /// Explicitly removes one job regardless of its `unscheduled_at`
    /// state (used by `shutdown(:kill)`/tests; normal removal goes
    /// through `delete_unscheduled`).
    pub fn remove(&self, id: JobId) -> Option<Job> {
        let mut inner = self.inner.lock();
        inner.remove_from_order(id);
        inner.storage.remove(id)
    }

    /// Snapshot copy of every stored job.
    pub fn to_a(&self) -> Vec<JobSnapshot> {
        let inner = self.inner.lock();
        inner.order.iter().map(|id| inner.storage[*id].snapshot(*id)).collect()
    }

    /// O(1) lookup by id, backed by the slotmap's generational index.
    pub fn lookup(&self, id: JobId) -> Option<JobSnapshot> {
        let inner = self.inner.lock();
        inner.storage.get(id).map(|job| job.snapshot(id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobArray {
    fn default() -> Self {
        Self::new()
    }
}
