//! Value migration between nodes.
//!
//! A migration copies the value onto the target node, swaps it into place
//! under the value's lock and only then drops the original. The tracker's
//! mutex is taken afterwards for bookkeeping, never across the copy.

mod adapters;

use crate::alloc::NodeAllocator;
use crate::error::{Error, Result};
use crate::hotness::{HotnessTracker, NumaState};
use crate::keyspace::Keyspace;
use crate::numa::NodeId;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cumulative migration counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Queued migrations dropped after waiting too long
    pub timeouts: u64,
    pub bytes_migrated: u64,
    pub time_us: u64,
    pub peak_concurrent: u64,
}

/// Outcome of one successful migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: Option<NodeId>,
    pub to: NodeId,
    pub bytes: usize,
    pub elapsed_us: u64,
}

/// Aggregate outcome of a batch; batches never fail as a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub bytes: usize,
}

impl BatchOutcome {
    fn record(&mut self, result: &Result<MigrationReport>) {
        match result {
            Ok(report) => {
                self.succeeded += 1;
                self.bytes += report.bytes;
            }
            Err(_) => self.failed += 1,
        }
    }
}

pub struct MigrationEngine {
    allocator: NodeAllocator,
    keyspace: Arc<Keyspace>,
    tracker: Arc<HotnessTracker>,
    state: Arc<Mutex<NumaState>>,
    in_flight: AtomicUsize,
}

impl MigrationEngine {
    pub fn new(allocator: NodeAllocator, keyspace: Arc<Keyspace>, tracker: Arc<HotnessTracker>) -> Self {
        let state = tracker.shared();
        Self {
            allocator,
            keyspace,
            tracker,
            state,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Migrations currently copying
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Moves the value under `key` onto `target`.
    ///
    /// On failure the original value is untouched.
    pub fn migrate_key(&self, key: &[u8], target: NodeId) -> Result<MigrationReport> {
        if target as usize >= self.allocator.node_count() {
            return Err(Error::InvalidArgument(format!(
                "target node {} out of range (0..{})",
                target,
                self.allocator.node_count()
            )));
        }
        let shared = self
            .keyspace
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("key {}", String::from_utf8_lossy(key))))?;

        let concurrent = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        let start = Instant::now();
        let result = {
            let mut value = shared.lock();
            let from = value.node();
            adapters::relocate(&value, &self.allocator, target).map(|relocated| {
                // The original drops here, after the copy is in place.
                *value = relocated.value;
                (from, relocated.bytes)
            })
        };
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        let elapsed_us = start.elapsed().as_micros() as u64;

        let mut untracked = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let stats = &mut state.migration;
            stats.total += 1;
            stats.time_us += elapsed_us;
            stats.peak_concurrent = stats.peak_concurrent.max(concurrent as u64);
            match &result {
                Ok((_, bytes)) => {
                    stats.successful += 1;
                    stats.bytes_migrated += *bytes as u64;
                    match state.metadata.get_mut(key) {
                        Some(meta) => meta.current_node = target,
                        None => untracked = true,
                    }
                    state.candidates.retain(|c| c.key != key);
                }
                Err(_) => stats.failed += 1,
            }
        }
        if untracked {
            self.adopt(key, target);
        }

        match result {
            Ok((from, bytes)) => {
                debug!(
                    from = ?from,
                    to = target,
                    bytes,
                    elapsed_us,
                    "Migrated value"
                );
                Ok(MigrationReport {
                    from,
                    to: target,
                    bytes,
                    elapsed_us,
                })
            }
            Err(e) => {
                warn!(to = target, "Migration failed: {}", e);
                Err(e)
            }
        }
    }

    /// Migrates every key independently.
    pub fn migrate_batch(&self, keys: &[Vec<u8>], target: NodeId) -> BatchOutcome {
        let results: Vec<_> = keys
            .par_iter()
            .map(|key| self.migrate_key(key, target))
            .collect();
        let mut outcome = BatchOutcome::default();
        for result in &results {
            outcome.record(result);
        }
        debug!(
            "Batch migration to node {}: {} succeeded, {} failed",
            target, outcome.succeeded, outcome.failed
        );
        outcome
    }

    /// Migrates the whole keyspace.
    pub fn migrate_all(&self, target: NodeId) -> BatchOutcome {
        let outcome = self.migrate_batch(&self.keyspace.keys(), target);
        info!(
            "Keyspace migration to node {}: {} succeeded, {} failed",
            target, outcome.succeeded, outcome.failed
        );
        outcome
    }

    /// Migrates keys matching a `*`/`?` glob.
    pub fn migrate_pattern(&self, pattern: &[u8], target: NodeId) -> BatchOutcome {
        self.migrate_batch(&self.keyspace.keys_matching(pattern), target)
    }

    /// Starts tracking a migrated key that had no metadata, unless it was
    /// deleted while it moved.
    fn adopt(&self, key: &[u8], node: NodeId) {
        if self.keyspace.contains(key) {
            self.tracker.track(key, node);
        }
    }

    pub(crate) fn record_timeouts(&self, count: u64) {
        if count > 0 {
            self.state.lock().migration.timeouts += count;
        }
    }

    pub fn stats(&self) -> MigrationStats {
        self.state.lock().migration
    }

    pub fn reset_stats(&self) {
        self.state.lock().migration = MigrationStats::default();
        info!("Migration statistics reset");
    }
}
