//! Allocation placement policy.
//!
//! Decides the node for each new allocation and keeps per-node counters
//! used for balance decisions.

use crate::alloc::{NodeAllocator, NodeBuf};
use crate::config::PolicyConfig;
use crate::error::{Error, Result};
use crate::numa::NodeId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Default weight of a node without an explicit one.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Placement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// The calling thread's node
    LocalFirst,
    /// Per-thread rotation starting at the local node
    #[default]
    Interleave,
    /// Process-wide rotation
    RoundRobin,
    /// Proportional to node weights
    Weighted,
    /// Least utilized node, nearer nodes first on ties
    PressureAware,
    /// Large allocations to the most distant node, the rest local
    #[serde(alias = "cxl-optimized")]
    SizeThreshold,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::LocalFirst,
        Strategy::Interleave,
        Strategy::RoundRobin,
        Strategy::Weighted,
        Strategy::PressureAware,
        Strategy::SizeThreshold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LocalFirst => "local-first",
            Strategy::Interleave => "interleave",
            Strategy::RoundRobin => "round-robin",
            Strategy::Weighted => "weighted",
            Strategy::PressureAware => "pressure-aware",
            Strategy::SizeThreshold => "size-threshold",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "local-first" | "local" => Ok(Strategy::LocalFirst),
            "interleave" | "interleaved" => Ok(Strategy::Interleave),
            "round-robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            "pressure-aware" => Ok(Strategy::PressureAware),
            "size-threshold" | "cxl-optimized" => Ok(Strategy::SizeThreshold),
            other => Err(Error::InvalidArgument(format!(
                "unknown strategy '{}', expected one of: {}",
                other,
                Strategy::ALL.map(|s| s.as_str()).join(", ")
            ))),
        }
    }
}

/// Suggested move from the most to the least utilized node
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RebalancePlan {
    pub from: NodeId,
    pub to: NodeId,
    pub spread: f64,
}

/// Per-node placement counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodePolicyStats {
    pub node: NodeId,
    pub allocations: u64,
    pub bytes: u64,
    pub weight: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyStats {
    pub strategy: Strategy,
    pub rebalances: u64,
    pub nodes: Vec<NodePolicyStats>,
}

thread_local! {
    static INTERLEAVE_CURSOR: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Placement policy with runtime-switchable strategy and weights.
pub struct ConfigurableAllocationPolicy {
    allocator: NodeAllocator,
    config: RwLock<PolicyConfig>,
    rr_cursor: AtomicUsize,
    /// Smooth weighted round-robin state
    wrr_current: Mutex<Vec<i64>>,
    allocations: Vec<AtomicU64>,
    bytes: Vec<AtomicU64>,
    rebalances: AtomicU64,
    last_rebalance: Mutex<Instant>,
}

impl ConfigurableAllocationPolicy {
    pub fn new(allocator: NodeAllocator, config: &PolicyConfig) -> Result<Self> {
        let nodes = allocator.node_count();
        let mut config = config.clone();
        if config.node_weights.len() > nodes {
            return Err(Error::InvalidArgument(format!(
                "{} node weights given for {} node(s)",
                config.node_weights.len(),
                nodes
            )));
        }
        config.node_weights.resize(nodes, DEFAULT_WEIGHT);

        info!(
            "Allocation policy: strategy={}, weights={:?}",
            config.strategy, config.node_weights
        );

        Ok(Self {
            allocator,
            config: RwLock::new(config),
            rr_cursor: AtomicUsize::new(0),
            wrr_current: Mutex::new(vec![0; nodes]),
            allocations: (0..nodes).map(|_| AtomicU64::new(0)).collect(),
            bytes: (0..nodes).map(|_| AtomicU64::new(0)).collect(),
            rebalances: AtomicU64::new(0),
            last_rebalance: Mutex::new(Instant::now()),
        })
    }

    pub fn allocator(&self) -> &NodeAllocator {
        &self.allocator
    }

    fn node_count(&self) -> usize {
        self.allocations.len()
    }

    /// Chooses a node for an allocation of `size` bytes without recording it.
    pub fn select_node(&self, size: usize) -> NodeId {
        let memory = self.allocator.memory();
        let nodes = self.node_count();
        let local = memory.resolve_node(memory.current_node());
        if nodes == 1 {
            return 0;
        }

        let config = self.config.read();
        match config.strategy {
            Strategy::LocalFirst => local,
            Strategy::Interleave => INTERLEAVE_CURSOR.with(|cursor| {
                let next = cursor.get().map_or(local as usize, |c| (c + 1) % nodes);
                cursor.set(Some(next));
                next as NodeId
            }),
            Strategy::RoundRobin => (self.rr_cursor.fetch_add(1, Ordering::Relaxed) % nodes) as NodeId,
            Strategy::Weighted => self.next_weighted(&config.node_weights).unwrap_or(local),
            Strategy::PressureAware => (0..nodes as NodeId)
                .min_by(|&a, &b| {
                    let ua = memory.usage(a).utilization();
                    let ub = memory.usage(b).utilization();
                    ua.total_cmp(&ub)
                        .then_with(|| memory.distance(local, a).cmp(&memory.distance(local, b)))
                })
                .unwrap_or(local),
            Strategy::SizeThreshold => {
                if size >= config.min_allocation_size_for_remote {
                    (0..nodes as NodeId)
                        .max_by_key(|&n| (memory.distance(local, n), n))
                        .unwrap_or(local)
                } else {
                    local
                }
            }
        }
    }

    /// Smooth weighted round-robin; `None` when all weights are zero.
    fn next_weighted(&self, weights: &[u32]) -> Option<NodeId> {
        let total: i64 = weights.iter().map(|&w| w as i64).sum();
        if total == 0 {
            return None;
        }
        let mut current = self.wrr_current.lock();
        let mut best = 0;
        for (i, &w) in weights.iter().enumerate() {
            current[i] += w as i64;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        Some(best as NodeId)
    }

    /// Chooses a node for `size` bytes and records the placement.
    pub fn place(&self, size: usize) -> NodeId {
        let node = self.select_node(size);
        self.record(node, size);
        node
    }

    fn record(&self, node: NodeId, size: usize) {
        if let Some(count) = self.allocations.get(node as usize) {
            count.fetch_add(1, Ordering::Relaxed);
            self.bytes[node as usize].fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    /// Allocates `size` bytes on the node the strategy picks.
    ///
    /// Exhaustion goes to the allocator's OOM handler.
    pub fn allocate(&self, size: usize) -> NodeBuf {
        let node = self.place(size);
        self.allocator.allocate(size, node)
    }

    /// Allocates `count * elem_size` zeroed bytes.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<NodeBuf> {
        let size = count.checked_mul(elem_size).ok_or_else(|| {
            Error::InvalidArgument(format!("{} x {} bytes overflows", count, elem_size))
        })?;
        Ok(self.allocate(size))
    }

    pub fn strategy(&self) -> Strategy {
        self.config.read().strategy
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        let mut config = self.config.write();
        if config.strategy != strategy {
            info!("Allocation strategy {} -> {}", config.strategy, strategy);
            config.strategy = strategy;
        }
    }

    pub fn weight(&self, node: NodeId) -> Result<u32> {
        self.config
            .read()
            .node_weights
            .get(node as usize)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("node {} out of range", node)))
    }

    pub fn set_weight(&self, node: NodeId, weight: u32) -> Result<()> {
        let mut config = self.config.write();
        let slot = config
            .node_weights
            .get_mut(node as usize)
            .ok_or_else(|| Error::InvalidArgument(format!("node {} out of range", node)))?;
        *slot = weight;
        self.wrr_current.lock().iter_mut().for_each(|c| *c = 0);
        debug!("Node {} weight set to {}", node, weight);
        Ok(())
    }

    pub fn set_balance_threshold(&self, threshold: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidArgument(format!(
                "balance threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        self.config.write().balance_threshold = threshold;
        Ok(())
    }

    pub fn set_cxl_optimization(&self, enabled: bool) {
        self.config.write().cxl_optimization_enabled = enabled;
    }

    pub fn set_auto_rebalance(&self, enabled: bool) {
        self.config.write().auto_rebalance = enabled;
    }

    /// Snapshot of the live configuration
    pub fn config(&self) -> PolicyConfig {
        self.config.read().clone()
    }

    fn utilization_spread(&self) -> Option<RebalancePlan> {
        let memory = self.allocator.memory();
        let utils: Vec<f64> = (0..self.node_count() as NodeId)
            .map(|n| memory.usage(n).utilization())
            .collect();
        let (from, max) = utils
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        let (to, min) = utils
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))?;
        Some(RebalancePlan {
            from: from as NodeId,
            to: to as NodeId,
            spread: max - min,
        })
    }

    /// Whether automatic rebalancing is due.
    ///
    /// True when enabled, the interval has elapsed and the utilization
    /// spread between the busiest and idlest node exceeds the threshold.
    pub fn needs_rebalance(&self) -> bool {
        let config = self.config.read();
        if !config.auto_rebalance || self.node_count() < 2 {
            return false;
        }
        if self.last_rebalance.lock().elapsed() < config.rebalance_interval() {
            return false;
        }
        self.utilization_spread()
            .is_some_and(|plan| plan.spread > config.balance_threshold)
    }

    /// Starts a rebalance round and returns the move to make, if any.
    pub fn trigger_rebalance(&self) -> Option<RebalancePlan> {
        *self.last_rebalance.lock() = Instant::now();
        self.rebalances.fetch_add(1, Ordering::Relaxed);
        let plan = self
            .utilization_spread()
            .filter(|plan| plan.from != plan.to && plan.spread > 0.0);
        if let Some(plan) = plan {
            info!(
                "Rebalancing node {} -> node {} (spread {:.2})",
                plan.from, plan.to, plan.spread
            );
        }
        plan
    }

    pub fn stats(&self) -> PolicyStats {
        let config = self.config.read();
        let memory = self.allocator.memory();
        PolicyStats {
            strategy: config.strategy,
            rebalances: self.rebalances.load(Ordering::Relaxed),
            nodes: (0..self.node_count())
                .map(|n| NodePolicyStats {
                    node: n as NodeId,
                    allocations: self.allocations[n].load(Ordering::Relaxed),
                    bytes: self.bytes[n].load(Ordering::Relaxed),
                    weight: config.node_weights[n],
                    utilization: memory.usage(n as NodeId).utilization(),
                })
                .collect(),
        }
    }

    pub fn reset_stats(&self) {
        for (count, bytes) in self.allocations.iter().zip(&self.bytes) {
            count.store(0, Ordering::Relaxed);
            bytes.store(0, Ordering::Relaxed);
        }
        self.rebalances.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocatorConfig;
    use crate::numa::{with_current_node, NodeMemory, SimulatedTopology};
    use std::sync::Arc;

    fn policy(nodes: usize, config: PolicyConfig) -> (Arc<SimulatedTopology>, ConfigurableAllocationPolicy) {
        let topo = Arc::new(SimulatedTopology::new(nodes, 1 << 20));
        let alloc = NodeAllocator::new(topo.clone(), &AllocatorConfig::default());
        (topo, ConfigurableAllocationPolicy::new(alloc, &config).unwrap())
    }

    #[test]
    fn test_strategy_names() {
        for s in Strategy::ALL {
            assert_eq!(s.as_str().parse::<Strategy>().unwrap(), s);
        }
        assert_eq!("cxl_optimized".parse::<Strategy>().unwrap(), Strategy::SizeThreshold);
        assert_eq!("interleaved".parse::<Strategy>().unwrap(), Strategy::Interleave);
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_local_first() {
        let (_topo, p) = policy(3, PolicyConfig {
            strategy: Strategy::LocalFirst,
            ..Default::default()
        });
        assert_eq!(with_current_node(2, || p.select_node(64)), 2);
    }

    #[test]
    fn test_round_robin_cycles() {
        let (_topo, p) = policy(3, PolicyConfig {
            strategy: Strategy::RoundRobin,
            ..Default::default()
        });
        let nodes: Vec<_> = (0..6).map(|_| p.place(8)).collect();
        assert_eq!(nodes, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_interleave_starts_local() {
        let (_topo, p) = policy(2, PolicyConfig::default());
        std::thread::spawn(move || {
            with_current_node(1, || {
                assert_eq!(p.select_node(8), 1);
                assert_eq!(p.select_node(8), 0);
                assert_eq!(p.select_node(8), 1);
            })
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_weighted_zero_weights_fall_back_local() {
        let (_topo, p) = policy(2, PolicyConfig {
            strategy: Strategy::Weighted,
            node_weights: vec![0, 0],
            ..Default::default()
        });
        assert_eq!(with_current_node(1, || p.select_node(8)), 1);
    }

    #[test]
    fn test_pressure_aware_prefers_idle_node() {
        let (topo, p) = policy(2, PolicyConfig {
            strategy: Strategy::PressureAware,
            ..Default::default()
        });
        assert!(topo.charge(0, 4096));
        assert_eq!(p.select_node(64), 1);
    }

    #[test]
    fn test_size_threshold_sends_large_far() {
        let topo = Arc::new(
            SimulatedTopology::new(3, 1 << 20)
                .with_distances(vec![vec![10, 20, 40], vec![20, 10, 40], vec![40, 40, 10]]),
        );
        let alloc = NodeAllocator::new(topo, &AllocatorConfig::default());
        let p = ConfigurableAllocationPolicy::new(
            alloc,
            &PolicyConfig {
                strategy: Strategy::SizeThreshold,
                min_allocation_size_for_remote: 1024,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(p.select_node(100), 0);
        assert_eq!(p.select_node(1024), 2);
        assert_eq!(p.select_node(4096), 2);
        // The flag is reported by NUMACONFIG GET but does not gate placement
        p.set_cxl_optimization(true);
        assert_eq!(p.select_node(100), 0);
    }

    #[test]
    fn test_weight_validation() {
        let (_topo, p) = policy(2, PolicyConfig::default());
        assert_eq!(p.weight(1).unwrap(), DEFAULT_WEIGHT);
        assert!(p.set_weight(5, 10).is_err());
        assert!(p.set_balance_threshold(2.0).is_err());
        p.set_weight(1, 10).unwrap();
        assert_eq!(p.config().node_weights, vec![100, 10]);
    }

    #[test]
    fn test_rebalance_detection() {
        let (topo, p) = policy(2, PolicyConfig {
            rebalance_interval_micros: 0,
            ..Default::default()
        });
        assert!(!p.needs_rebalance());

        // Half of node 0 in use, node 1 idle
        assert!(topo.charge(0, 1 << 19));
        assert!(p.needs_rebalance());

        let plan = p.trigger_rebalance().unwrap();
        assert_eq!((plan.from, plan.to), (0, 1));
        assert!((plan.spread - 0.5).abs() < 1e-9);
        assert_eq!(p.stats().rebalances, 1);

        p.set_auto_rebalance(false);
        assert!(!p.needs_rebalance());
    }

    #[test]
    fn test_allocate_records_counters() {
        let (_topo, p) = policy(2, PolicyConfig {
            strategy: Strategy::RoundRobin,
            ..Default::default()
        });
        let a = p.allocate(100);
        let b = p.allocate_zeroed(10, 30).unwrap();
        assert_eq!((a.node(), b.node()), (0, 1));
        assert!(b.iter().all(|&x| x == 0));

        let stats = p.stats();
        assert_eq!(stats.nodes[0].bytes, 100);
        assert_eq!(stats.nodes[1].bytes, 300);
        assert!(p.allocate_zeroed(usize::MAX, 2).is_err());

        p.reset_stats();
        assert_eq!(p.stats().nodes[0].allocations, 0);
    }
}
