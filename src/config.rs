//! Runtime configuration.
//!
//! Configuration is layered: built-in defaults, an optional TOML file and
//! `NUMAKV__*` environment variables (double underscore separates sections,
//! e.g. `NUMAKV__POLICY__STRATEGY=weighted`).

use crate::error::{Error, Result};
use crate::hotness::MAX_HOTNESS;
use crate::numa::NodeId;
use crate::policy::Strategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a [`crate::NumaContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumaConfig {
    #[serde(default)]
    pub allocator: AllocatorConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub hotness: HotnessConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Allocator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Fully free slabs kept per (node, class) before memory is released.
    #[serde(default = "default_empty_slab_cache")]
    pub empty_slab_cache: usize,

    /// Free lists longer than this are dropped by compaction.
    #[serde(default = "default_compact_free_list_max")]
    pub compact_free_list_max: usize,

    /// A chunk is a release candidate below this used/capacity ratio.
    #[serde(default = "default_compact_threshold")]
    pub compact_utilization_threshold: f64,

    /// Minimum free fraction of a chunk before it may be released.
    #[serde(default = "default_compact_min_free_ratio")]
    pub compact_min_free_ratio: f64,
}

fn default_empty_slab_cache() -> usize {
    2
}

fn default_compact_free_list_max() -> usize {
    10
}

fn default_compact_threshold() -> f64 {
    0.3
}

fn default_compact_min_free_ratio() -> f64 {
    0.5
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            empty_slab_cache: default_empty_slab_cache(),
            compact_free_list_max: default_compact_free_list_max(),
            compact_utilization_threshold: default_compact_threshold(),
            compact_min_free_ratio: default_compact_min_free_ratio(),
        }
    }
}

/// Allocation placement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Relative weight per node; missing entries default to 100.
    #[serde(default)]
    pub node_weights: Vec<u32>,

    /// Max-min utilization spread that triggers rebalancing.
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,

    #[serde(default = "default_true")]
    pub auto_rebalance: bool,

    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_micros: u64,

    /// Reported alongside the strategy; placement uses the size threshold alone.
    #[serde(default)]
    pub cxl_optimization_enabled: bool,

    /// Size-threshold strategy sends allocations of at least this size remote.
    #[serde(default = "default_min_remote_size")]
    pub min_allocation_size_for_remote: usize,
}

fn default_balance_threshold() -> f64 {
    0.3
}

fn default_true() -> bool {
    true
}

fn default_rebalance_interval() -> u64 {
    5_000_000
}

fn default_min_remote_size() -> usize {
    4096
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            node_weights: Vec::new(),
            balance_threshold: default_balance_threshold(),
            auto_rebalance: true,
            rebalance_interval_micros: default_rebalance_interval(),
            cxl_optimization_enabled: false,
            min_allocation_size_for_remote: default_min_remote_size(),
        }
    }
}

impl PolicyConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_micros(self.rebalance_interval_micros)
    }
}

/// Per-value hotness tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotnessConfig {
    /// Hotness assigned to newly tracked values.
    #[serde(default = "default_initial_hotness")]
    pub initial_hotness: u8,

    /// Remote accesses at or above this hotness queue a migration.
    #[serde(default = "default_migrate_threshold")]
    pub migrate_threshold: u8,

    /// Idle ticks after which decay lowers hotness by one level.
    #[serde(default = "default_decay_threshold_ticks")]
    pub decay_threshold_ticks: u16,
}

fn default_initial_hotness() -> u8 {
    3
}

fn default_migrate_threshold() -> u8 {
    5
}

fn default_decay_threshold_ticks() -> u16 {
    10_000
}

impl Default for HotnessConfig {
    fn default() -> Self {
        Self {
            initial_hotness: default_initial_hotness(),
            migrate_threshold: default_migrate_threshold(),
            decay_threshold_ticks: default_decay_threshold_ticks(),
        }
    }
}

/// Strategy scheduler and the built-in composite policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the maintenance thread.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Interval between decay sweeps run by the composite policy.
    #[serde(default = "default_decay_interval")]
    pub decay_interval_ms: u64,

    /// Consecutive idle sweeps required before one hotness level is lost.
    #[serde(default = "default_stability_count")]
    pub stability_count: u32,

    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,

    #[serde(default = "default_bandwidth_threshold")]
    pub bandwidth_threshold: f64,

    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold: f64,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_ms: u64,

    /// Bytes the composite policy may migrate per execution.
    #[serde(default = "default_bandwidth_budget")]
    pub bandwidth_budget_bytes: u64,

    /// Concurrent migrations counted as full migration pressure.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_migrations: usize,
}

fn default_maintenance_interval() -> u64 {
    1000
}

fn default_decay_interval() -> u64 {
    10_000
}

fn default_stability_count() -> u32 {
    1
}

fn default_overload_threshold() -> f64 {
    0.8
}

fn default_bandwidth_threshold() -> f64 {
    0.9
}

fn default_pressure_threshold() -> f64 {
    0.7
}

fn default_max_pending() -> usize {
    1000
}

fn default_pending_timeout() -> u64 {
    30_000
}

fn default_bandwidth_budget() -> u64 {
    64 * 1024 * 1024
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: default_maintenance_interval(),
            decay_interval_ms: default_decay_interval(),
            stability_count: default_stability_count(),
            overload_threshold: default_overload_threshold(),
            bandwidth_threshold: default_bandwidth_threshold(),
            pressure_threshold: default_pressure_threshold(),
            max_pending: default_max_pending(),
            pending_timeout_ms: default_pending_timeout(),
            bandwidth_budget_bytes: default_bandwidth_budget(),
            max_concurrent_migrations: default_max_concurrent(),
        }
    }
}

impl SchedulerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_millis(self.decay_interval_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }
}

/// Targets for explicit hot/cold marking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Node that receives values marked hot.
    #[serde(default)]
    pub hot_node: NodeId,

    /// Node that receives values marked cold; the last node when unset.
    #[serde(default)]
    pub cold_node: Option<NodeId>,
}

impl NumaConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration builder.
    pub fn builder() -> NumaConfigBuilder {
        NumaConfigBuilder::default()
    }

    /// Loads configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix("NUMAKV")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file only.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        let ratios = [
            ("allocator.compact_utilization_threshold", self.allocator.compact_utilization_threshold),
            ("allocator.compact_min_free_ratio", self.allocator.compact_min_free_ratio),
            ("policy.balance_threshold", self.policy.balance_threshold),
            ("scheduler.overload_threshold", self.scheduler.overload_threshold),
            ("scheduler.bandwidth_threshold", self.scheduler.bandwidth_threshold),
            ("scheduler.pressure_threshold", self.scheduler.pressure_threshold),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidArgument(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.hotness.initial_hotness > MAX_HOTNESS || self.hotness.migrate_threshold > MAX_HOTNESS {
            return Err(Error::InvalidArgument(format!(
                "hotness levels must not exceed {}",
                MAX_HOTNESS
            )));
        }

        if self.scheduler.max_pending == 0 || self.scheduler.max_concurrent_migrations == 0 {
            return Err(Error::InvalidArgument(
                "scheduler.max_pending and scheduler.max_concurrent_migrations must be positive"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`NumaConfig`].
#[derive(Debug, Default)]
pub struct NumaConfigBuilder {
    config: NumaConfig,
}

impl NumaConfigBuilder {
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.policy.strategy = strategy;
        self
    }

    pub fn node_weights(mut self, weights: Vec<u32>) -> Self {
        self.config.policy.node_weights = weights;
        self
    }

    pub fn balance_threshold(mut self, threshold: f64) -> Self {
        self.config.policy.balance_threshold = threshold;
        self
    }

    pub fn auto_rebalance(mut self, enabled: bool) -> Self {
        self.config.policy.auto_rebalance = enabled;
        self
    }

    pub fn cxl_optimization(mut self, enabled: bool, min_remote_size: usize) -> Self {
        self.config.policy.cxl_optimization_enabled = enabled;
        self.config.policy.min_allocation_size_for_remote = min_remote_size;
        self
    }

    pub fn migrate_threshold(mut self, threshold: u8) -> Self {
        self.config.hotness.migrate_threshold = threshold;
        self
    }

    pub fn decay_threshold_ticks(mut self, ticks: u16) -> Self {
        self.config.hotness.decay_threshold_ticks = ticks;
        self
    }

    pub fn maintenance_interval_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.maintenance_interval_ms = ms;
        self
    }

    pub fn decay_interval_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.decay_interval_ms = ms;
        self
    }

    pub fn pending_timeout_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.pending_timeout_ms = ms;
        self
    }

    pub fn empty_slab_cache(mut self, slabs: usize) -> Self {
        self.config.allocator.empty_slab_cache = slabs;
        self
    }

    pub fn hot_cold_nodes(mut self, hot: NodeId, cold: Option<NodeId>) -> Self {
        self.config.migration.hot_node = hot;
        self.config.migration.cold_node = cold;
        self
    }

    pub fn build(self) -> Result<NumaConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
