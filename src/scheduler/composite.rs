//! Stability-first composite policy (slot 1).
//!
//! Each round:
//! 1. runs a stability-gated hotness decay when the decay interval elapsed,
//! 2. pulls migration candidates from the tracker into the pending queue,
//! 3. drains the queue, migrating entries whose target node has headroom and
//!    dropping entries that waited past the timeout,
//! 4. queues the hottest values of the busiest node when placement reports
//!    an imbalance.

use super::{Policy, PolicyContext, PolicyFactory, Priority};
use crate::config::{NumaConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::numa::NodeId;
use serde::Serialize;
use std::collections::VecDeque;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

pub(super) const NAME: &str = "composite-lru";

const DESCRIPTION: &str = "Stability-first composite hotness management";

/// Values queued per rebalance round
const REBALANCE_BATCH: usize = 50;

/// Why a target node cannot take a migration right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    Available,
    Overloaded,
    BandwidthSaturated,
    MigrationPressure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompositeStats {
    pub heat_updates: u64,
    pub migrations_triggered: u64,
    pub migrations_completed: u64,
    pub migrations_failed: u64,
    pub decay_operations: u64,
    pub pending_timeouts: u64,
    pub deferred: u64,
}

#[derive(Debug, Clone)]
struct PendingMigration {
    key: Vec<u8>,
    target: NodeId,
    enqueued: Instant,
}

pub struct CompositePolicy {
    decay_interval: Duration,
    stability_count: u32,
    overload_threshold: f64,
    bandwidth_threshold: f64,
    pressure_threshold: f64,
    max_pending: usize,
    pending_timeout: Duration,
    bandwidth_budget: u64,
    max_concurrent: usize,
    last_decay: Option<Instant>,
    pending: VecDeque<PendingMigration>,
    stats: CompositeStats,
}

pub(super) fn factory() -> PolicyFactory {
    PolicyFactory {
        name: NAME.to_string(),
        description: DESCRIPTION.to_string(),
        priority: Priority::High,
        interval: Duration::from_secs(1),
        create: |config: &NumaConfig| -> Box<dyn Policy> {
            Box::new(CompositePolicy::new(&config.scheduler))
        },
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid value '{}' for {}", value, key)))
}

fn parse_ratio(key: &str, value: &str) -> Result<f64> {
    let ratio: f64 = parse(key, value)?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(Error::InvalidArgument(format!(
            "{} must be within [0, 1], got {}",
            key, ratio
        )));
    }
    Ok(ratio)
}

impl CompositePolicy {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            decay_interval: config.decay_interval(),
            stability_count: config.stability_count,
            overload_threshold: config.overload_threshold,
            bandwidth_threshold: config.bandwidth_threshold,
            pressure_threshold: config.pressure_threshold,
            max_pending: config.max_pending,
            pending_timeout: config.pending_timeout(),
            bandwidth_budget: config.bandwidth_budget_bytes,
            max_concurrent: config.max_concurrent_migrations,
            last_decay: None,
            pending: VecDeque::new(),
            stats: CompositeStats::default(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn composite_stats(&self) -> CompositeStats {
        self.stats
    }

    /// Queues `key` for `target`, replacing an older entry for the same key.
    fn enqueue(&mut self, key: Vec<u8>, target: NodeId, now: Instant) {
        if let Some(existing) = self.pending.iter_mut().find(|p| p.key == key) {
            existing.target = target;
            return;
        }
        if self.pending.len() >= self.max_pending {
            trace!("Pending migration queue full, dropping candidate");
            return;
        }
        self.pending.push_back(PendingMigration {
            key,
            target,
            enqueued: now,
        });
    }

    /// Headroom of `node` given the bytes already moved this round.
    pub fn resource_status(&self, ctx: &PolicyContext, node: NodeId, round_bytes: u64) -> ResourceStatus {
        let usage = ctx.placement.allocator().memory().usage(node);
        if usage.utilization() >= self.overload_threshold {
            return ResourceStatus::Overloaded;
        }
        if self.bandwidth_budget > 0
            && round_bytes as f64 / self.bandwidth_budget as f64 >= self.bandwidth_threshold
        {
            return ResourceStatus::BandwidthSaturated;
        }
        let pressure = ctx.engine.in_flight() as f64 / self.max_concurrent.max(1) as f64;
        if pressure >= self.pressure_threshold {
            return ResourceStatus::MigrationPressure;
        }
        ResourceStatus::Available
    }

    fn decay_if_due(&mut self, ctx: &PolicyContext, now: Instant) {
        let due = self
            .last_decay
            .map_or(true, |last| now.saturating_duration_since(last) >= self.decay_interval);
        if !due {
            return;
        }
        ctx.tracker.decay_with_stability(self.stability_count);
        self.stats.decay_operations += 1;
        self.last_decay = Some(now);
    }

    fn collect_candidates(&mut self, ctx: &PolicyContext, now: Instant) {
        let candidates = ctx.tracker.take_candidates();
        self.stats.heat_updates += candidates.len() as u64;
        for candidate in candidates {
            self.enqueue(candidate.key, candidate.target, now);
        }
    }

    /// Returns how many entries expired this round.
    fn process_pending(&mut self, ctx: &PolicyContext, now: Instant) -> u64 {
        let mut round_bytes = 0u64;
        let mut timeouts = 0u64;
        let mut keep = VecDeque::with_capacity(self.pending.len());

        while let Some(entry) = self.pending.pop_front() {
            if now.saturating_duration_since(entry.enqueued) > self.pending_timeout {
                timeouts += 1;
                continue;
            }

            let status = self.resource_status(ctx, entry.target, round_bytes);
            if status != ResourceStatus::Available {
                trace!(node = entry.target, ?status, "Deferring migration");
                self.stats.deferred += 1;
                keep.push_back(entry);
                continue;
            }

            self.stats.migrations_triggered += 1;
            match ctx.engine.migrate_key(&entry.key, entry.target) {
                Ok(report) => {
                    self.stats.migrations_completed += 1;
                    round_bytes += report.bytes as u64;
                }
                // Deleted while queued
                Err(Error::NotFound(_)) => {}
                Err(_) => self.stats.migrations_failed += 1,
            }
        }

        self.pending = keep;
        if timeouts > 0 {
            self.stats.pending_timeouts += timeouts;
            ctx.engine.record_timeouts(timeouts);
            debug!("Dropped {} timed-out pending migrations", timeouts);
        }
        timeouts
    }

    fn balance_load(&mut self, ctx: &PolicyContext, now: Instant) {
        if !ctx.placement.needs_rebalance() {
            return;
        }
        let Some(plan) = ctx.placement.trigger_rebalance() else {
            return;
        };
        let hottest = ctx.tracker.hottest_on(plan.from, REBALANCE_BATCH);
        info!(
            "Queueing {} value(s) from node {} to node {}",
            hottest.len(),
            plan.from,
            plan.to
        );
        for (key, _) in hottest {
            self.enqueue(key, plan.to, now);
        }
    }
}

impl Policy for CompositePolicy {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn execute(&mut self, ctx: &PolicyContext, now: Instant) -> Result<()> {
        self.decay_if_due(ctx, now);
        self.collect_candidates(ctx, now);
        let expired = self.process_pending(ctx, now);
        self.balance_load(ctx, now);
        if expired > 0 {
            return Err(Error::Timeout(format!(
                "{} pending migration(s) waited longer than {:?}",
                expired, self.pending_timeout
            )));
        }
        Ok(())
    }

    fn configure(&mut self, ctx: &PolicyContext, key: &str, value: &str) -> Result<()> {
        match key {
            "decay_threshold" => self.decay_interval = Duration::from_secs(parse(key, value)?),
            "stability_count" => self.stability_count = parse::<u32>(key, value)?.max(1),
            "migrate_threshold" => ctx.tracker.set_migrate_threshold(parse(key, value)?),
            "overload_threshold" => self.overload_threshold = parse_ratio(key, value)?,
            "bandwidth_threshold" => self.bandwidth_threshold = parse_ratio(key, value)?,
            "pressure_threshold" => self.pressure_threshold = parse_ratio(key, value)?,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{} has no option '{}'",
                    NAME, other
                )))
            }
        }
        Ok(())
    }

    fn get_config(&self, ctx: &PolicyContext, key: &str) -> Result<String> {
        let value = match key {
            "decay_threshold" => self.decay_interval.as_secs().to_string(),
            "stability_count" => self.stability_count.to_string(),
            "migrate_threshold" => ctx.tracker.migrate_threshold().to_string(),
            "overload_threshold" => format!("{:.2}", self.overload_threshold),
            "bandwidth_threshold" => format!("{:.2}", self.bandwidth_threshold),
            "pressure_threshold" => format!("{:.2}", self.pressure_threshold),
            "heat_updates" => self.stats.heat_updates.to_string(),
            "migrations_triggered" => self.stats.migrations_triggered.to_string(),
            "decay_operations" => self.stats.decay_operations.to_string(),
            "pending_timeouts" => self.stats.pending_timeouts.to_string(),
            "pending" => self.pending.len().to_string(),
            other => {
                return Err(Error::InvalidArgument(format!(
                    "{} has no option '{}'",
                    NAME, other
                )))
            }
        };
        Ok(value)
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::to_value(self.stats).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::NodeAllocator;
    use crate::clock::ManualClock;
    use crate::hotness::HotnessTracker;
    use crate::keyspace::Keyspace;
    use crate::migrate::MigrationEngine;
    use crate::numa::SimulatedTopology;
    use crate::policy::ConfigurableAllocationPolicy;
    use crate::value::{EncodingHints, PlainValue, Value};
    use std::sync::Arc;

    struct Fixture {
        alloc: NodeAllocator,
        keyspace: Arc<Keyspace>,
        clock: Arc<ManualClock>,
        ctx: PolicyContext,
    }

    fn fixture(config: &NumaConfig) -> Fixture {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 20));
        let alloc = NodeAllocator::new(topo, &config.allocator);
        let keyspace = Arc::new(Keyspace::new());
        let clock = Arc::new(ManualClock::new(0));
        let tracker = Arc::new(HotnessTracker::new(&config.hotness, clock.clone()));
        let engine = Arc::new(MigrationEngine::new(alloc.clone(), keyspace.clone(), tracker.clone()));
        let placement = Arc::new(ConfigurableAllocationPolicy::new(alloc.clone(), &config.policy).unwrap());
        Fixture {
            alloc,
            keyspace,
            clock,
            ctx: PolicyContext {
                placement,
                tracker,
                engine,
            },
        }
    }

    fn put(f: &Fixture, key: &[u8], node: NodeId) {
        let value = Value::build(
            &f.alloc,
            node,
            &PlainValue::Bytes(b"payload".to_vec()),
            &EncodingHints::default(),
        )
        .unwrap();
        f.keyspace.insert(key, value);
        f.ctx.tracker.track(key, node);
    }

    fn no_rebalance() -> NumaConfig {
        let mut config = NumaConfig::default();
        config.policy.auto_rebalance = false;
        config
    }

    #[test]
    fn test_candidate_is_migrated() {
        let config = no_rebalance();
        let f = fixture(&config);
        put(&f, b"k", 0);
        f.ctx.tracker.set_hotness(b"k", 5);
        assert!(f.ctx.tracker.record_access(b"k", 1).is_some());

        let mut policy = CompositePolicy::new(&config.scheduler);
        policy.execute(&f.ctx, Instant::now()).unwrap();

        assert_eq!(f.keyspace.get(b"k").unwrap().lock().node(), Some(1));
        assert_eq!(f.ctx.tracker.get(b"k").unwrap().current_node, 1);
        let stats = policy.composite_stats();
        assert_eq!(stats.heat_updates, 1);
        assert_eq!(stats.migrations_completed, 1);
        assert_eq!(policy.pending(), 0);
    }

    #[test]
    fn test_overloaded_target_defers_then_times_out() {
        let config = no_rebalance();
        let f = fixture(&config);
        put(&f, b"k", 0);
        f.ctx.tracker.set_hotness(b"k", 6);
        f.ctx.tracker.record_access(b"k", 1);

        // Fill node 1 past the overload threshold
        let _ballast = f.alloc.try_allocate(900 * 1024, 1).unwrap();

        let mut policy = CompositePolicy::new(&config.scheduler);
        let t0 = Instant::now();
        policy.execute(&f.ctx, t0).unwrap();
        assert_eq!(policy.pending(), 1);
        assert_eq!(policy.resource_status(&f.ctx, 1, 0), ResourceStatus::Overloaded);

        let err = policy.execute(&f.ctx, t0 + Duration::from_secs(31)).unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(policy.pending(), 0);
        assert_eq!(policy.composite_stats().pending_timeouts, 1);
        assert_eq!(f.ctx.engine.stats().timeouts, 1);
        assert_eq!(f.keyspace.get(b"k").unwrap().lock().node(), Some(0));
    }

    #[test]
    fn test_bandwidth_budget_defers_rest_of_round() {
        let mut config = no_rebalance();
        config.scheduler.bandwidth_budget_bytes = 10;
        let f = fixture(&config);
        for key in [&b"a"[..], b"b"] {
            put(&f, key, 0);
            f.ctx.tracker.set_hotness(key, 7);
            f.ctx.tracker.record_access(key, 1);
        }

        let mut policy = CompositePolicy::new(&config.scheduler);
        let t0 = Instant::now();
        policy.execute(&f.ctx, t0).unwrap();
        // 7 bytes of 10 moved: 0.7 < 0.9, the second also goes; third would wait
        assert_eq!(policy.composite_stats().migrations_completed, 2);

        config.scheduler.bandwidth_budget_bytes = 7;
        let mut strict = CompositePolicy::new(&config.scheduler);
        put(&f, b"c", 0);
        put(&f, b"d", 0);
        for key in [&b"c"[..], b"d"] {
            f.ctx.tracker.set_hotness(key, 7);
            f.ctx.tracker.record_access(key, 1);
        }
        strict.execute(&f.ctx, t0).unwrap();
        assert_eq!(strict.composite_stats().migrations_completed, 1);
        assert_eq!(strict.pending(), 1);
    }

    #[test]
    fn test_decay_runs_on_interval() {
        let config = no_rebalance();
        let f = fixture(&config);
        put(&f, b"k", 0);
        f.clock.advance(20_000);

        let mut policy = CompositePolicy::new(&config.scheduler);
        let t0 = Instant::now();
        policy.execute(&f.ctx, t0).unwrap();
        assert_eq!(f.ctx.tracker.get(b"k").unwrap().hotness, 2);

        policy.execute(&f.ctx, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(f.ctx.tracker.get(b"k").unwrap().hotness, 2);
        assert_eq!(policy.get_config(&f.ctx, "decay_operations").unwrap(), "1");

        policy.execute(&f.ctx, t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(f.ctx.tracker.get(b"k").unwrap().hotness, 1);
    }

    #[test]
    fn test_rebalance_queues_hottest_from_busiest_node() {
        let mut config = NumaConfig::default();
        config.policy.auto_rebalance = true;
        config.policy.rebalance_interval_micros = 0;
        config.policy.balance_threshold = 0.1;
        let f = fixture(&config);
        put(&f, b"hot", 0);
        f.ctx.tracker.set_hotness(b"hot", 7);
        let _ballast = f.alloc.try_allocate(512 * 1024, 0).unwrap();

        let mut policy = CompositePolicy::new(&config.scheduler);
        let t0 = Instant::now();
        policy.execute(&f.ctx, t0).unwrap();
        assert_eq!(policy.pending(), 1);

        policy.execute(&f.ctx, t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(f.keyspace.get(b"hot").unwrap().lock().node(), Some(1));
    }

    #[test]
    fn test_configuration_keys() {
        let config = no_rebalance();
        let f = fixture(&config);
        let mut policy = CompositePolicy::new(&config.scheduler);

        policy.configure(&f.ctx, "migrate_threshold", "6").unwrap();
        assert_eq!(f.ctx.tracker.migrate_threshold(), 6);
        policy.configure(&f.ctx, "overload_threshold", "0.5").unwrap();
        assert_eq!(policy.get_config(&f.ctx, "overload_threshold").unwrap(), "0.50");
        policy.configure(&f.ctx, "decay_threshold", "3").unwrap();
        assert_eq!(policy.get_config(&f.ctx, "decay_threshold").unwrap(), "3");

        assert!(policy.configure(&f.ctx, "overload_threshold", "1.5").is_err());
        assert!(policy.configure(&f.ctx, "stability_count", "x").is_err());
        assert!(policy.get_config(&f.ctx, "unknown").is_err());
    }
}
