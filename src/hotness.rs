//! Per-value hotness tracking.
//!
//! Every access updates the value's metadata. Local accesses warm the value
//! up to [`MAX_HOTNESS`]; a remote access to a value at or above the
//! migration threshold queues it as a candidate for the accessing node.
//! Only [`HotnessTracker::decay`] cools values down.
//!
//! The metadata map shares one mutex with the migration counters, see
//! [`crate::migrate::MigrationEngine`].

use crate::clock::{tick_delta, TickClock};
use crate::config::HotnessConfig;
use crate::migrate::MigrationStats;
use crate::numa::NodeId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub const MAX_HOTNESS: u8 = 7;

/// Queued candidates beyond this drop the oldest entry.
const MAX_CANDIDATES: usize = 4096;

/// NUMA metadata of one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyNumaMetadata {
    pub current_node: NodeId,
    pub hotness: u8,
    pub last_access: u16,
    pub access_count: u64,
    #[serde(skip)]
    idle_sweeps: u32,
}

/// A value that should move to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCandidate {
    pub key: Vec<u8>,
    pub target: NodeId,
    pub hotness: u8,
}

/// Outcome of one decay sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecayReport {
    pub scanned: usize,
    pub decayed: usize,
    pub pruned: usize,
}

/// State guarded by the tracker's mutex.
#[derive(Default)]
pub(crate) struct NumaState {
    pub(crate) metadata: HashMap<Vec<u8>, KeyNumaMetadata>,
    pub(crate) candidates: VecDeque<MigrationCandidate>,
    pub(crate) migration: MigrationStats,
}

pub struct HotnessTracker {
    state: Arc<Mutex<NumaState>>,
    clock: Arc<dyn TickClock>,
    initial_hotness: u8,
    migrate_threshold: AtomicU8,
    decay_threshold: u16,
}

impl HotnessTracker {
    pub fn new(config: &HotnessConfig, clock: Arc<dyn TickClock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(NumaState::default())),
            clock,
            initial_hotness: config.initial_hotness.min(MAX_HOTNESS),
            migrate_threshold: AtomicU8::new(config.migrate_threshold),
            decay_threshold: config.decay_threshold_ticks,
        }
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<NumaState>> {
        self.state.clone()
    }

    pub fn clock(&self) -> &Arc<dyn TickClock> {
        &self.clock
    }

    pub fn migrate_threshold(&self) -> u8 {
        self.migrate_threshold.load(Ordering::Relaxed)
    }

    pub fn set_migrate_threshold(&self, threshold: u8) {
        self.migrate_threshold
            .store(threshold.min(MAX_HOTNESS), Ordering::Relaxed);
    }

    fn fresh(&self, node: NodeId, now: u16) -> KeyNumaMetadata {
        KeyNumaMetadata {
            current_node: node,
            hotness: self.initial_hotness,
            last_access: now,
            access_count: 0,
            idle_sweeps: 0,
        }
    }

    /// Starts tracking a value stored on `node`, or updates its node.
    pub fn track(&self, key: &[u8], node: NodeId) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state
            .metadata
            .entry(key.to_vec())
            .and_modify(|m| m.current_node = node)
            .or_insert_with(|| self.fresh(node, now));
    }

    /// Records an access from `executing_node`.
    ///
    /// Returns the migration candidate queued by this access, if any.
    pub fn record_access(&self, key: &[u8], executing_node: NodeId) -> Option<MigrationCandidate> {
        let now = self.clock.now();
        let threshold = self.migrate_threshold();
        let mut state = self.state.lock();

        let meta = match state.metadata.get_mut(key) {
            Some(meta) => meta,
            None => {
                let mut meta = self.fresh(executing_node, now);
                meta.access_count = 1;
                state.metadata.insert(key.to_vec(), meta);
                return None;
            }
        };

        meta.access_count += 1;
        meta.last_access = now;
        meta.idle_sweeps = 0;

        if meta.current_node == executing_node {
            meta.hotness = (meta.hotness + 1).min(MAX_HOTNESS);
            return None;
        }

        if meta.hotness < threshold {
            return None;
        }

        let candidate = MigrationCandidate {
            key: key.to_vec(),
            target: executing_node,
            hotness: meta.hotness,
        };
        trace!(
            node = executing_node,
            hotness = meta.hotness,
            "Remote access queued migration candidate"
        );

        let queue = &mut state.candidates;
        if let Some(existing) = queue.iter_mut().find(|c| c.key == candidate.key) {
            *existing = candidate.clone();
        } else {
            if queue.len() >= MAX_CANDIDATES {
                queue.pop_front();
            }
            queue.push_back(candidate.clone());
        }
        Some(candidate)
    }

    /// Lowers hotness of values idle past the decay threshold by one level.
    pub fn decay(&self) -> DecayReport {
        self.decay_with_stability(1)
    }

    /// Like [`HotnessTracker::decay`], but a value must be idle for
    /// `stability` consecutive sweeps before it loses a level. Idle values
    /// already at zero are pruned.
    pub fn decay_with_stability(&self, stability: u32) -> DecayReport {
        let now = self.clock.now();
        let stability = stability.max(1);
        let mut report = DecayReport::default();
        let mut state = self.state.lock();

        state.metadata.retain(|_, meta| {
            report.scanned += 1;
            if tick_delta(now, meta.last_access) <= self.decay_threshold {
                return true;
            }
            if meta.hotness == 0 {
                report.pruned += 1;
                return false;
            }
            meta.idle_sweeps += 1;
            if meta.idle_sweeps >= stability {
                meta.hotness -= 1;
                meta.idle_sweeps = 0;
                report.decayed += 1;
            }
            true
        });

        if report.decayed > 0 || report.pruned > 0 {
            debug!(
                "Hotness decay: scanned={}, decayed={}, pruned={}",
                report.scanned, report.decayed, report.pruned
            );
        }
        report
    }

    pub fn get(&self, key: &[u8]) -> Option<KeyNumaMetadata> {
        self.state.lock().metadata.get(key).copied()
    }

    /// Overrides the hotness of a tracked value.
    pub fn set_hotness(&self, key: &[u8], hotness: u8) -> bool {
        match self.state.lock().metadata.get_mut(key) {
            Some(meta) => {
                meta.hotness = hotness.min(MAX_HOTNESS);
                true
            }
            None => false,
        }
    }

    /// Stops tracking a deleted value.
    pub fn remove(&self, key: &[u8]) -> Option<KeyNumaMetadata> {
        let mut state = self.state.lock();
        state.candidates.retain(|c| c.key != key);
        state.metadata.remove(key)
    }

    /// Forgets every tracked value and queued candidate.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.metadata.clear();
        state.candidates.clear();
    }

    /// Drains queued migration candidates, oldest first.
    pub fn take_candidates(&self) -> Vec<MigrationCandidate> {
        self.state.lock().candidates.drain(..).collect()
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().candidates.len()
    }

    /// Hottest values currently on `node`, hottest first.
    pub fn hottest_on(&self, node: NodeId, limit: usize) -> Vec<(Vec<u8>, u8)> {
        let state = self.state.lock();
        let mut hot: Vec<_> = state
            .metadata
            .iter()
            .filter(|(_, m)| m.current_node == node)
            .map(|(k, m)| (k.clone(), m.hotness, m.access_count))
            .collect();
        hot.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        hot.into_iter().take(limit).map(|(k, h, _)| (k, h)).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker(clock: Arc<ManualClock>) -> HotnessTracker {
        HotnessTracker::new(&HotnessConfig::default(), clock)
    }

    #[test]
    fn test_first_access_creates_metadata() {
        let clock = Arc::new(ManualClock::new(100));
        let t = tracker(clock);
        assert!(t.record_access(b"k", 1).is_none());

        let meta = t.get(b"k").unwrap();
        assert_eq!(meta.current_node, 1);
        assert_eq!(meta.hotness, 3);
        assert_eq!(meta.access_count, 1);
        assert_eq!(meta.last_access, 100);
    }

    #[test]
    fn test_local_access_caps_at_max() {
        let t = tracker(Arc::new(ManualClock::new(0)));
        t.track(b"k", 0);
        for _ in 0..20 {
            t.record_access(b"k", 0);
        }
        assert_eq!(t.get(b"k").unwrap().hotness, MAX_HOTNESS);
        assert_eq!(t.get(b"k").unwrap().access_count, 20);
    }

    #[test]
    fn test_remote_access_below_threshold_does_not_queue() {
        let t = tracker(Arc::new(ManualClock::new(0)));
        t.track(b"k", 0);
        assert!(t.record_access(b"k", 1).is_none());
        assert_eq!(t.get(b"k").unwrap().hotness, 3);
        assert_eq!(t.pending_candidates(), 0);
    }

    #[test]
    fn test_candidates_are_deduplicated() {
        let t = tracker(Arc::new(ManualClock::new(0)));
        t.track(b"k", 0);
        t.set_hotness(b"k", 6);

        assert!(t.record_access(b"k", 1).is_some());
        assert!(t.record_access(b"k", 2).is_some());
        let queued = t.take_candidates();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].target, 2);
        assert_eq!(t.pending_candidates(), 0);
    }

    #[test]
    fn test_decay_respects_threshold_and_wraps() {
        let clock = Arc::new(ManualClock::new(65_000));
        let t = tracker(clock.clone());
        t.track(b"k", 0);
        t.set_hotness(b"k", 2);

        // 10_000 ticks later, across the wrap: not beyond the threshold yet
        clock.advance(10_000);
        assert_eq!(t.decay().decayed, 0);

        clock.advance(1);
        assert_eq!(t.decay().decayed, 1);
        assert_eq!(t.get(b"k").unwrap().hotness, 1);
        assert_eq!(t.decay().decayed, 1);
        assert_eq!(t.get(b"k").unwrap().hotness, 0);

        // Stale and cold: pruned
        assert_eq!(t.decay().pruned, 1);
        assert!(t.get(b"k").is_none());
    }

    #[test]
    fn test_decay_stability_gate() {
        let clock = Arc::new(ManualClock::new(0));
        let t = tracker(clock.clone());
        t.track(b"k", 0);
        clock.advance(20_000);

        assert_eq!(t.decay_with_stability(3).decayed, 0);
        assert_eq!(t.decay_with_stability(3).decayed, 0);
        assert_eq!(t.decay_with_stability(3).decayed, 1);
        assert_eq!(t.get(b"k").unwrap().hotness, 2);
    }

    #[test]
    fn test_hottest_on_node() {
        let t = tracker(Arc::new(ManualClock::new(0)));
        t.track(b"a", 0);
        t.track(b"b", 0);
        t.track(b"c", 1);
        t.set_hotness(b"b", 7);

        let hot = t.hottest_on(0, 1);
        assert_eq!(hot, vec![(b"b".to_vec(), 7)]);
        assert!(t.remove(b"b").is_some());
        assert_eq!(t.len(), 2);
    }
}
