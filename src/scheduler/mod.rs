//! Priority-scheduled policy slots.
//!
//! The scheduler owns a fixed table of [`MAX_SLOTS`] slots. Each occupied
//! slot holds a boxed [`Policy`] with an enable flag, a priority and an
//! execution interval. [`StrategyScheduler::run_all`] visits slots from
//! high to low priority, in slot order within a priority, and runs every
//! enabled slot whose interval has elapsed.
//!
//! Slot 0 always holds the `noop` baseline; slot 1 holds the
//! `composite-lru` policy by default.

mod composite;
mod noop;

pub use composite::{CompositePolicy, CompositeStats, ResourceStatus};
pub use noop::NoopPolicy;

use crate::config::NumaConfig;
use crate::error::{Error, Result};
use crate::hotness::HotnessTracker;
use crate::migrate::MigrationEngine;
use crate::policy::ConfigurableAllocationPolicy;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const MAX_SLOTS: usize = 16;
pub const NOOP_SLOT: usize = 0;
pub const DEFAULT_SLOT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Priority {
    /// Execution order of a scheduling round
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        })
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(Error::InvalidArgument(format!("unknown priority '{}'", other))),
        }
    }
}

/// Handles a policy acts through.
#[derive(Clone)]
pub struct PolicyContext {
    pub placement: Arc<ConfigurableAllocationPolicy>,
    pub tracker: Arc<HotnessTracker>,
    pub engine: Arc<MigrationEngine>,
}

/// A pluggable scheduling policy.
pub trait Policy: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Runs one round. `now` is the scheduler's notion of time.
    fn execute(&mut self, ctx: &PolicyContext, now: Instant) -> Result<()>;

    fn configure(&mut self, _ctx: &PolicyContext, key: &str, _value: &str) -> Result<()> {
        Err(Error::InvalidArgument(format!(
            "policy '{}' has no option '{}'",
            self.name(),
            key
        )))
    }

    fn get_config(&self, _ctx: &PolicyContext, key: &str) -> Result<String> {
        Err(Error::InvalidArgument(format!(
            "policy '{}' has no option '{}'",
            self.name(),
            key
        )))
    }

    /// Policy-specific counters
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Constructor registered under a policy name
#[derive(Clone)]
pub struct PolicyFactory {
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub interval: Duration,
    pub create: fn(&NumaConfig) -> Box<dyn Policy>,
}

struct Slot {
    policy: Arc<Mutex<Box<dyn Policy>>>,
    name: String,
    description: String,
    priority: Priority,
    interval: Duration,
    enabled: bool,
    last_run: Option<Instant>,
    executions: u64,
    failures: u64,
    total_time_us: u64,
}

impl Slot {
    fn due(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }
}

/// Snapshot of one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub slot: usize,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub priority: Priority,
    pub interval_ms: u64,
    pub executions: u64,
    pub failures: u64,
    pub total_time_us: u64,
    pub stats: serde_json::Value,
}

pub struct StrategyScheduler {
    slots: Mutex<[Option<Slot>; MAX_SLOTS]>,
    factories: RwLock<HashMap<String, PolicyFactory>>,
    context: PolicyContext,
    config: NumaConfig,
    rounds: AtomicU64,
}

fn check_slot(id: usize) -> Result<()> {
    if id >= MAX_SLOTS {
        return Err(Error::InvalidArgument(format!(
            "slot {} out of range (0..{})",
            id, MAX_SLOTS
        )));
    }
    Ok(())
}

fn empty_slot(id: usize) -> Error {
    Error::NotFound(format!("slot {} is empty", id))
}

impl StrategyScheduler {
    /// Creates the scheduler with the built-in policies installed.
    pub fn new(config: &NumaConfig, context: PolicyContext) -> Result<Self> {
        let scheduler = Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            factories: RwLock::new(HashMap::new()),
            context,
            config: config.clone(),
            rounds: AtomicU64::new(0),
        };

        scheduler.register_factory(noop::factory())?;
        scheduler.register_factory(composite::factory())?;
        scheduler.insert(NOOP_SLOT, noop::NAME)?;
        scheduler.insert(DEFAULT_SLOT, composite::NAME)?;

        info!("Strategy scheduler initialized with {} slots", MAX_SLOTS);
        Ok(scheduler)
    }

    pub fn context(&self) -> &PolicyContext {
        &self.context
    }

    pub fn register_factory(&self, factory: PolicyFactory) -> Result<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(&factory.name) {
            return Err(Error::AlreadyExists(format!(
                "policy '{}' already registered",
                factory.name
            )));
        }
        debug!("Registered policy factory '{}'", factory.name);
        factories.insert(factory.name.clone(), factory);
        Ok(())
    }

    /// Names of registered policies, sorted
    pub fn factories(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Installs a new instance of policy `name` into slot `id`.
    pub fn insert(&self, id: usize, name: &str) -> Result<()> {
        check_slot(id)?;
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no policy named '{}'", name)))?;

        let mut slots = self.slots.lock();
        if let Some(existing) = &slots[id] {
            return Err(Error::AlreadyExists(format!(
                "slot {} holds '{}'",
                id, existing.name
            )));
        }
        slots[id] = Some(Slot {
            policy: Arc::new(Mutex::new((factory.create)(&self.config))),
            name: factory.name.clone(),
            description: factory.description.clone(),
            priority: factory.priority,
            interval: factory.interval,
            enabled: true,
            last_run: None,
            executions: 0,
            failures: 0,
            total_time_us: 0,
        });
        info!("Inserted policy '{}' into slot {}", name, id);
        Ok(())
    }

    pub fn remove(&self, id: usize) -> Result<()> {
        check_slot(id)?;
        if id == NOOP_SLOT {
            return Err(Error::InvalidArgument(
                "slot 0 is reserved for the baseline policy".to_string(),
            ));
        }
        let removed = self.slots.lock()[id].take().ok_or_else(|| empty_slot(id))?;
        info!("Removed policy '{}' from slot {}", removed.name, id);
        Ok(())
    }

    fn with_slot<R>(&self, id: usize, f: impl FnOnce(&mut Slot) -> R) -> Result<R> {
        check_slot(id)?;
        let mut slots = self.slots.lock();
        slots[id].as_mut().map(f).ok_or_else(|| empty_slot(id))
    }

    pub fn enable(&self, id: usize) -> Result<()> {
        self.with_slot(id, |slot| slot.enabled = true)
    }

    pub fn disable(&self, id: usize) -> Result<()> {
        self.with_slot(id, |slot| slot.enabled = false)
    }

    pub fn set_priority(&self, id: usize, priority: Priority) -> Result<()> {
        self.with_slot(id, |slot| slot.priority = priority)
    }

    pub fn set_interval(&self, id: usize, interval: Duration) -> Result<()> {
        self.with_slot(id, |slot| slot.interval = interval)
    }

    /// Sets a policy option. `priority` and `interval_ms` apply to the slot.
    pub fn configure(&self, id: usize, key: &str, value: &str) -> Result<()> {
        match key {
            "priority" => return self.set_priority(id, value.parse()?),
            "interval_ms" => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("bad interval '{}'", value)))?;
                return self.set_interval(id, Duration::from_millis(ms));
            }
            _ => {}
        }
        let policy = self.with_slot(id, |slot| slot.policy.clone())?;
        let result = policy.lock().configure(&self.context, key, value);
        if result.is_ok() {
            debug!("Slot {} config set: {} = {}", id, key, value);
        }
        result
    }

    pub fn get_config(&self, id: usize, key: &str) -> Result<String> {
        let policy = self.with_slot(id, |slot| slot.policy.clone())?;
        let value = policy.lock().get_config(&self.context, key);
        value
    }

    /// Runs slot `id` if it is enabled and due.
    ///
    /// Returns whether the policy executed.
    pub fn run_slot(&self, id: usize) -> Result<bool> {
        self.run_slot_at(id, Instant::now())
    }

    pub fn run_slot_at(&self, id: usize, now: Instant) -> Result<bool> {
        let policy = self.with_slot(id, |slot| {
            (slot.enabled && slot.due(now)).then(|| slot.policy.clone()).ok_or(slot.enabled)
        })?;
        let policy = match policy {
            Ok(policy) => policy,
            Err(true) => return Ok(false),
            Err(false) => return Err(Error::NotFound(format!("slot {} is disabled", id))),
        };

        let start = Instant::now();
        let result = policy.lock().execute(&self.context, now);
        let elapsed = start.elapsed().as_micros() as u64;

        let _ = self.with_slot(id, |slot| {
            slot.last_run = Some(now);
            slot.executions += 1;
            slot.total_time_us += elapsed;
            if result.is_err() {
                slot.failures += 1;
            }
        });

        if let Err(e) = &result {
            warn!("Policy in slot {} failed: {}", id, e);
        }
        result.map(|_| true)
    }

    /// One scheduling round. Returns how many policies executed.
    pub fn run_all(&self) -> usize {
        self.run_all_at(Instant::now())
    }

    pub fn run_all_at(&self, now: Instant) -> usize {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        let order: Vec<usize> = {
            let slots = self.slots.lock();
            Priority::DESCENDING
                .iter()
                .flat_map(|&priority| {
                    slots
                        .iter()
                        .enumerate()
                        .filter(move |(_, s)| {
                            s.as_ref()
                                .is_some_and(|s| s.enabled && s.priority == priority)
                        })
                        .map(|(id, _)| id)
                })
                .collect()
        };

        order
            .into_iter()
            .filter(|&id| matches!(self.run_slot_at(id, now), Ok(true)))
            .count()
    }

    /// Rounds run so far
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub fn status(&self, id: usize) -> Result<SlotStatus> {
        check_slot(id)?;
        let slots = self.slots.lock();
        slots[id]
            .as_ref()
            .map(|slot| snapshot(id, slot))
            .ok_or_else(|| empty_slot(id))
    }

    /// Occupied slots in slot order
    pub fn list(&self) -> Vec<SlotStatus> {
        let slots = self.slots.lock();
        slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|s| snapshot(id, s)))
            .collect()
    }
}

fn snapshot(id: usize, slot: &Slot) -> SlotStatus {
    SlotStatus {
        slot: id,
        name: slot.name.clone(),
        description: slot.description.clone(),
        enabled: slot.enabled,
        priority: slot.priority,
        interval_ms: slot.interval.as_millis() as u64,
        executions: slot.executions,
        failures: slot.failures,
        total_time_us: slot.total_time_us,
        stats: slot.policy.lock().stats(),
    }
}
