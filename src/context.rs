//! Process-wide NUMA context.
//!
//! [`NumaContext`] owns every component of the subsystem and is the entry
//! point the host (and the command surface) talks to. It is created once
//! with [`NumaContext::init`] and torn down with [`NumaContext::shutdown`].

use crate::alloc::{AllocatorStats, CompactionReport, NodeAllocator};
use crate::clock::{LruClock, TickClock};
use crate::config::NumaConfig;
use crate::error::{Error, Result};
use crate::hotness::{HotnessTracker, MigrationCandidate, MAX_HOTNESS};
use crate::keyspace::{Keyspace, SharedValue};
use crate::migrate::{MigrationEngine, MigrationReport, MigrationStats};
use crate::numa::{NodeId, NodeMemory};
use crate::policy::{ConfigurableAllocationPolicy, PolicyStats};
use crate::scheduler::{PolicyContext, SlotStatus, StrategyScheduler};
use crate::value::{Encoding, EncodingHints, PlainValue, Value, ValueKind};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Placement and hotness of one stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub kind: ValueKind,
    pub encoding: Encoding,
    /// `None` for integer-encoded scalars, which own no node memory.
    pub current_node: Option<NodeId>,
    pub hotness: u8,
    pub access_count: u64,
    pub numa_nodes_available: usize,
    pub current_cpu_node: NodeId,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub policies_run: usize,
    pub compaction: CompactionReport,
}

/// Snapshot of every counter in the subsystem
#[derive(Debug, Clone, Serialize)]
pub struct NumaStats {
    pub keys: usize,
    pub allocator: AllocatorStats,
    pub placement: PolicyStats,
    pub migration: MigrationStats,
    pub slots: Vec<SlotStatus>,
}

pub struct NumaContext {
    config: NumaConfig,
    allocator: NodeAllocator,
    placement: Arc<ConfigurableAllocationPolicy>,
    keyspace: Arc<Keyspace>,
    tracker: Arc<HotnessTracker>,
    engine: Arc<MigrationEngine>,
    scheduler: StrategyScheduler,
    hints: EncodingHints,
    running: AtomicBool,
}

impl NumaContext {
    /// Builds the subsystem on `memory` with a seconds-resolution access clock.
    pub fn init(config: NumaConfig, memory: Arc<dyn NodeMemory>) -> Result<Arc<Self>> {
        Self::with_clock(config, memory, Arc::new(LruClock::new()))
    }

    /// Builds the subsystem with an explicit access clock.
    pub fn with_clock(
        config: NumaConfig,
        memory: Arc<dyn NodeMemory>,
        clock: Arc<dyn TickClock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let nodes = memory.node_count();
        if config.migration.hot_node as usize >= nodes {
            return Err(Error::InvalidArgument(format!(
                "migration.hot_node {} out of range (0..{})",
                config.migration.hot_node, nodes
            )));
        }
        if let Some(cold) = config.migration.cold_node {
            if cold as usize >= nodes {
                return Err(Error::InvalidArgument(format!(
                    "migration.cold_node {} out of range (0..{})",
                    cold, nodes
                )));
            }
        }

        let allocator = NodeAllocator::new(memory, &config.allocator);
        let placement = Arc::new(ConfigurableAllocationPolicy::new(allocator.clone(), &config.policy)?);
        let keyspace = Arc::new(Keyspace::new());
        let tracker = Arc::new(HotnessTracker::new(&config.hotness, clock));
        let engine = Arc::new(MigrationEngine::new(
            allocator.clone(),
            keyspace.clone(),
            tracker.clone(),
        ));
        let scheduler = StrategyScheduler::new(
            &config,
            PolicyContext {
                placement: placement.clone(),
                tracker: tracker.clone(),
                engine: engine.clone(),
            },
        )?;

        info!(
            nodes,
            strategy = %placement.strategy(),
            "NUMA context initialized"
        );

        Ok(Arc::new(Self {
            config,
            allocator,
            placement,
            keyspace,
            tracker,
            engine,
            scheduler,
            hints: EncodingHints::default(),
            running: AtomicBool::new(true),
        }))
    }

    pub fn config(&self) -> &NumaConfig {
        &self.config
    }

    pub fn allocator(&self) -> &NodeAllocator {
        &self.allocator
    }

    pub fn placement(&self) -> &Arc<ConfigurableAllocationPolicy> {
        &self.placement
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }

    pub fn tracker(&self) -> &Arc<HotnessTracker> {
        &self.tracker
    }

    pub fn engine(&self) -> &Arc<MigrationEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &StrategyScheduler {
        &self.scheduler
    }

    pub fn node_count(&self) -> usize {
        self.allocator.node_count()
    }

    /// Node the calling thread runs on.
    pub fn current_node(&self) -> NodeId {
        let memory = self.allocator.memory();
        memory.resolve_node(memory.current_node())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::InvalidArgument("context is shut down".to_string()))
        }
    }

    /// Stores `plain` under `key` on the node chosen by the placement strategy.
    pub fn store(&self, key: &[u8], plain: &PlainValue) -> Result<NodeId> {
        self.ensure_running()?;
        let node = self.placement.place(plain.byte_size());
        self.store_on(key, plain, node)?;
        Ok(node)
    }

    /// Stores `plain` under `key` on an explicit node.
    pub fn store_on(&self, key: &[u8], plain: &PlainValue, node: NodeId) -> Result<()> {
        self.ensure_running()?;
        if node as usize >= self.node_count() {
            return Err(Error::InvalidArgument(format!(
                "node {} out of range (0..{})",
                node,
                self.node_count()
            )));
        }
        let value = match Value::build(&self.allocator, node, plain, &self.hints) {
            Ok(value) => value,
            Err(Error::OutOfMemory(reason)) => {
                error!(node, "Cannot store value: {}", reason);
                self.allocator.out_of_memory(plain.byte_size(), node)
            }
            Err(e) => return Err(e),
        };
        self.keyspace.insert(key, value);
        self.tracker.track(key, node);
        Ok(())
    }

    /// Looks up `key` and records an access from the calling thread's node.
    pub fn access(&self, key: &[u8]) -> Option<SharedValue> {
        let value = self.keyspace.get(key)?;
        self.on_access(key, self.current_node());
        Some(value)
    }

    /// Records an access to `key` from `executing_node`.
    pub fn on_access(&self, key: &[u8], executing_node: NodeId) -> Option<MigrationCandidate> {
        let candidate = self.tracker.record_access(key, executing_node);
        if let Some(c) = &candidate {
            debug!(target_node = c.target, hotness = c.hotness, "Queued migration candidate");
        }
        candidate
    }

    /// Reads `key` back as plain content, recording the access.
    pub fn read(&self, key: &[u8]) -> Result<PlainValue> {
        let shared = self.access(key).ok_or_else(|| not_found(key))?;
        let value = shared.lock();
        value.to_plain()
    }

    /// Deletes `key`; returns whether it existed.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.tracker.remove(key);
        self.keyspace.remove(key).is_some()
    }

    /// Marks `key` hot and moves it to the configured hot node.
    pub fn mark_hot(&self, key: &[u8]) -> Result<MigrationReport> {
        let target = self.config.migration.hot_node;
        self.mark(key, MAX_HOTNESS, target)
    }

    /// Marks `key` cold and moves it to the configured cold node.
    pub fn mark_cold(&self, key: &[u8]) -> Result<MigrationReport> {
        self.mark(key, 0, self.cold_node())
    }

    /// The cold node, defaulting to the last node.
    pub fn cold_node(&self) -> NodeId {
        self.config
            .migration
            .cold_node
            .unwrap_or((self.node_count() - 1) as NodeId)
    }

    fn mark(&self, key: &[u8], hotness: u8, target: NodeId) -> Result<MigrationReport> {
        if !self.keyspace.contains(key) {
            return Err(not_found(key));
        }
        let report = self.engine.migrate_key(key, target)?;
        self.tracker.set_hotness(key, hotness);
        Ok(report)
    }

    /// Placement and hotness of `key`.
    pub fn key_info(&self, key: &[u8]) -> Result<KeyInfo> {
        let shared = self.keyspace.get(key).ok_or_else(|| not_found(key))?;
        let (kind, encoding, node) = {
            let value = shared.lock();
            (value.kind(), value.encoding(), value.node())
        };
        let meta = self.tracker.get(key);
        Ok(KeyInfo {
            kind,
            encoding,
            current_node: node,
            hotness: meta.map_or(0, |m| m.hotness),
            access_count: meta.map_or(0, |m| m.access_count),
            numa_nodes_available: self.node_count(),
            current_cpu_node: self.current_node(),
        })
    }

    /// Runs the due policies and compacts the pools.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let policies_run = self.scheduler.run_all();
        let compaction = self.allocator.compact();
        MaintenanceReport {
            policies_run,
            compaction,
        }
    }

    pub fn stats(&self) -> NumaStats {
        NumaStats {
            keys: self.keyspace.len(),
            allocator: self.allocator.stats(),
            placement: self.placement.stats(),
            migration: self.engine.stats(),
            slots: self.scheduler.list(),
        }
    }

    pub fn reset_stats(&self) {
        self.allocator.reset_stats();
        self.placement.reset_stats();
        self.engine.reset_stats();
    }

    /// Drops every stored value and stops maintenance.
    ///
    /// Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let keys = self.keyspace.len();
        self.keyspace.clear();
        self.tracker.clear();
        let compaction = self.allocator.compact();
        info!(
            keys,
            chunks_released = compaction.chunks_released,
            "NUMA context shut down"
        );
    }
}

fn not_found(key: &[u8]) -> Error {
    Error::NotFound(format!("key {}", String::from_utf8_lossy(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::numa::{with_current_node, SimulatedTopology};
    use crate::policy::Strategy;

    fn context() -> Arc<NumaContext> {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 24));
        NumaContext::with_clock(NumaConfig::default(), topo, Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn test_store_read_delete() {
        let ctx = context();
        let node = ctx.store(b"k", &PlainValue::Bytes(b"hello".to_vec())).unwrap();
        assert_eq!(ctx.key_info(b"k").unwrap().current_node, Some(node));
        assert_eq!(ctx.read(b"k").unwrap(), PlainValue::Bytes(b"hello".to_vec()));

        assert!(ctx.delete(b"k"));
        assert!(!ctx.delete(b"k"));
        assert!(ctx.tracker().get(b"k").is_none());
        assert_eq!(ctx.read(b"k").unwrap_err().kind(), "not-found");
    }

    #[test]
    fn test_weighted_placement_drives_store() {
        let ctx = context();
        ctx.placement().set_strategy(Strategy::Weighted);
        ctx.placement().set_weight(0, 0).unwrap();
        ctx.placement().set_weight(1, 100).unwrap();
        let node = ctx.store(b"k", &PlainValue::Bytes(b"abc".to_vec())).unwrap();
        assert_eq!(node, 1);
    }

    #[test]
    fn test_mark_hot_and_cold() {
        let ctx = context();
        ctx.store_on(b"k", &PlainValue::Bytes(b"data".to_vec()), 1).unwrap();

        let report = ctx.mark_hot(b"k").unwrap();
        assert_eq!(report.to, 0);
        let info = ctx.key_info(b"k").unwrap();
        assert_eq!(info.current_node, Some(0));
        assert_eq!(info.hotness, MAX_HOTNESS);

        ctx.mark_cold(b"k").unwrap();
        let info = ctx.key_info(b"k").unwrap();
        assert_eq!(info.current_node, Some(1));
        assert_eq!(info.hotness, 0);

        assert_eq!(ctx.mark_hot(b"missing").unwrap_err().kind(), "not-found");
    }

    #[test]
    fn test_remote_access_feeds_maintenance() {
        let ctx = context();
        ctx.store_on(b"k", &PlainValue::Bytes(b"data".to_vec()), 0).unwrap();
        ctx.tracker().set_hotness(b"k", 5);

        with_current_node(1, || {
            assert!(ctx.access(b"k").is_some());
        });
        assert_eq!(ctx.tracker().pending_candidates(), 1);

        let report = ctx.run_maintenance();
        assert_eq!(report.policies_run, 2);
        assert_eq!(ctx.key_info(b"k").unwrap().current_node, Some(1));
    }

    #[test]
    fn test_init_rejects_out_of_range_hot_node() {
        let mut config = NumaConfig::default();
        config.migration.hot_node = 5;
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 20));
        let err = NumaContext::init(config, topo).err().unwrap();
        assert_eq!(err.kind(), "invalid-argument");
    }

    #[test]
    fn test_shutdown_releases_values() {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 24));
        let ctx = NumaContext::init(NumaConfig::default(), topo.clone()).unwrap();
        ctx.store_on(b"k", &PlainValue::Bytes(vec![1u8; 10_000]), 1).unwrap();
        assert!(topo.usage(1).used > 0);

        ctx.shutdown();
        assert!(!ctx.is_running());
        assert!(ctx.keyspace().is_empty());
        assert!(ctx.tracker().is_empty());
        assert_eq!(topo.usage(1).used, 0);
        ctx.shutdown();
    }

    #[test]
    fn test_store_rejected_after_shutdown() {
        let ctx = context();
        ctx.shutdown();

        let plain = PlainValue::Bytes(b"late".to_vec());
        assert_eq!(ctx.store(b"k", &plain).unwrap_err().kind(), "invalid-argument");
        assert_eq!(ctx.store_on(b"k", &plain, 0).unwrap_err().kind(), "invalid-argument");
        assert!(ctx.keyspace().is_empty());
        assert_eq!(ctx.placement().stats().nodes[0].allocations, 0);
    }

    fn panicking_oom(size: usize, node: NodeId) -> ! {
        panic!("store oom: {} bytes on node {}", size, node)
    }

    #[test]
    #[should_panic(expected = "store oom: 4096 bytes on node 0")]
    fn test_store_exhaustion_invokes_oom_handler() {
        let topo = Arc::new(SimulatedTopology::new(1, 1024));
        let ctx = NumaContext::init(NumaConfig::default(), topo).unwrap();
        ctx.allocator().set_oom_handler(panicking_oom);
        let _ = ctx.store(b"k", &PlainValue::Bytes(vec![7u8; 4096]));
    }
}
