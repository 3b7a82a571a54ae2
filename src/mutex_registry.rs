// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Named-mutex registry.
//!
//! Jobs that name one or more mutexes in their `opts` serialize against
//! every other job sharing any of those names. Mutexes are created
//! lazily on first reference and live for the scheduler's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// Holds every named mutex a scheduler has ever seen a job reference.
pub struct MutexRegistry {
    mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// RAII guard bundle: holds every lock a job's `acquire_all` took, in
/// acquisition order, and releases them in reverse on drop.
pub struct MutexGuards {
    _guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        MutexRegistry { mutexes: Mutex::new(HashMap::new()) }
    }

    fn handle_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut mutexes = self.mutexes.lock();
        mutexes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires every named mutex in `names`, sorted lexicographically
    /// first, to avoid deadlocking against another job that names an
    /// overlapping but differently-ordered set.
    ///
    /// Blocks the calling thread until every lock is held.
    pub fn acquire_all(&self, names: &[String]) -> MutexGuards {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();

        let guards = sorted
            .into_iter()
            .map(|name| self.handle_for(name).lock_arc())
            .collect();

        MutexGuards { _guards: guards }
    }
}

impl Default for MutexRegistry {
    fn default() -> Self {
        Self::new()
    }
}
