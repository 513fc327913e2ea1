//! Text command surface.
//!
//! Three command families mirror the host's control commands:
//!
//! - `NUMAMIGRATE` moves values between nodes and reports migration stats,
//! - `NUMACONFIG` inspects and changes the placement policy,
//! - `NUMASLOT` manages the strategy scheduler's slots.
//!
//! Commands never fail; errors come back as [`Reply::Error`] in the form
//! `ERR <kind>: <message>`.

use crate::context::NumaContext;
use crate::error::{Error, Result};
use crate::migrate::BatchOutcome;
use crate::numa::NodeId;
use crate::policy::Strategy;
use crate::scheduler::Priority;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reply to one command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Integer(i64),
    Bulk(String),
    Array(Vec<Reply>),
    /// Ordered field/value pairs
    Map(Vec<(String, Reply)>),
    Error(String),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Field of a [`Reply::Map`]
    pub fn field(&self, name: &str) -> Option<&Reply> {
        match self {
            Reply::Map(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Bulk(s) => Some(s),
            _ => None,
        }
    }

    fn map<const N: usize>(fields: [(&str, Reply); N]) -> Self {
        Reply::Map(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    fn lines(lines: &[&str]) -> Self {
        Reply::Array(lines.iter().map(|l| Reply::Bulk(l.to_string())).collect())
    }

    /// Converts any serializable snapshot into a reply tree.
    pub fn from_serialize<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Self::from_json(json),
            Err(e) => Reply::from(Error::Internal(e.to_string())),
        }
    }

    fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Reply::Bulk(String::new()),
            Json::Bool(b) => Reply::Bulk(if b { "yes" } else { "no" }.to_string()),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Reply::Integer(i),
                None => Reply::Bulk(n.to_string()),
            },
            Json::String(s) => Reply::Bulk(s),
            Json::Array(items) => Reply::Array(items.into_iter().map(Self::from_json).collect()),
            Json::Object(fields) => Reply::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Plain JSON form, used by the CLI.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Reply::Ok => Json::String("OK".to_string()),
            Reply::Integer(n) => Json::from(*n),
            Reply::Bulk(s) => Json::String(s.clone()),
            Reply::Array(items) => Json::Array(items.iter().map(Reply::to_json).collect()),
            Reply::Map(fields) => Json::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Reply::Error(e) => serde_json::json!({ "error": e }),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Reply::Ok => writeln!(f, "{}OK", pad),
            Reply::Integer(n) => writeln!(f, "{}(integer) {}", pad, n),
            Reply::Bulk(s) => writeln!(f, "{}\"{}\"", pad, s),
            Reply::Error(e) => writeln!(f, "{}(error) {}", pad, e),
            Reply::Array(items) if items.is_empty() => writeln!(f, "{}(empty array)", pad),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    writeln!(f, "{}{})", pad, i + 1)?;
                    item.write_indented(f, depth + 1)?;
                }
                Ok(())
            }
            Reply::Map(fields) => {
                for (k, v) in fields {
                    writeln!(f, "{}{}:", pad, k)?;
                    v.write_indented(f, depth + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

impl From<Error> for Reply {
    fn from(e: Error) -> Self {
        Reply::Error(format!("ERR {}: {}", e.kind(), e.message()))
    }
}

impl From<BatchOutcome> for Reply {
    fn from(outcome: BatchOutcome) -> Self {
        Reply::map([
            ("succeeded", Reply::Integer(outcome.succeeded as i64)),
            ("failed", Reply::Integer(outcome.failed as i64)),
            ("bytes", Reply::Integer(outcome.bytes as i64)),
        ])
    }
}

const MIGRATE_HELP: &[&str] = &[
    "NUMAMIGRATE KEY <key> <target_node> - Migrate a key to target NUMA node",
    "NUMAMIGRATE DB <target_node> - Migrate entire keyspace to target NUMA node",
    "NUMAMIGRATE BATCH <target_node> <key> [<key> ...] - Migrate several keys",
    "NUMAMIGRATE PATTERN <pattern> <target_node> - Migrate keys matching a glob",
    "NUMAMIGRATE HOT <key> - Mark a key hot and move it to the hot node",
    "NUMAMIGRATE COLD <key> - Mark a key cold and move it to the cold node",
    "NUMAMIGRATE STATS - Show migration statistics",
    "NUMAMIGRATE RESET - Reset migration statistics",
    "NUMAMIGRATE INFO <key> - Get NUMA info for a key",
    "NUMAMIGRATE HELP - Show this help message",
];

const CONFIG_HELP: &[&str] = &[
    "NUMACONFIG GET",
    "NUMACONFIG SET strategy <name>",
    "NUMACONFIG SET weight <node> <weight>",
    "NUMACONFIG SET cxl_optimization <on/off>",
    "NUMACONFIG SET balance_threshold <percent>",
    "NUMACONFIG REBALANCE",
    "NUMACONFIG STATS",
    "NUMACONFIG HELP",
];

const SLOT_HELP: &[&str] = &[
    "NUMASLOT LIST",
    "NUMASLOT STATUS <slot>",
    "NUMASLOT ENABLE <slot>",
    "NUMASLOT DISABLE <slot>",
    "NUMASLOT INSERT <slot> <policy>",
    "NUMASLOT REMOVE <slot>",
    "NUMASLOT CONFIG <slot> <key> [<value>]",
    "NUMASLOT RUN <slot>",
    "NUMASLOT PRIORITY <slot> <low|normal|high>",
    "NUMASLOT INTERVAL <slot> <milliseconds>",
    "NUMASLOT HELP",
];

/// Largest accepted node weight
const MAX_WEIGHT: u32 = 1000;

/// Executes control commands against a [`NumaContext`].
pub struct CommandDispatcher {
    ctx: Arc<NumaContext>,
}

impl CommandDispatcher {
    pub fn new(ctx: Arc<NumaContext>) -> Self {
        Self { ctx }
    }

    /// Splits `line` on whitespace and executes it.
    pub fn execute_line(&self, line: &str) -> Reply {
        let args: Vec<&str> = line.split_whitespace().collect();
        self.execute(&args)
    }

    /// Executes one command; `args[0]` is the command name.
    pub fn execute(&self, args: &[&str]) -> Reply {
        let Some((command, rest)) = args.split_first() else {
            return Reply::from(Error::InvalidArgument("empty command".to_string()));
        };
        debug!("Executing {} with {} argument(s)", command, rest.len());

        let result = match command.to_ascii_uppercase().as_str() {
            "NUMAMIGRATE" => self.numa_migrate(rest),
            "NUMACONFIG" => self.numa_config(rest),
            "NUMASLOT" => self.numa_slot(rest),
            other => Err(Error::InvalidArgument(format!("unknown command '{}'", other))),
        };
        result.unwrap_or_else(Reply::from)
    }

    fn numa_migrate(&self, args: &[&str]) -> Result<Reply> {
        let sub = subcommand(args, "NUMAMIGRATE")?;
        match sub.as_str() {
            "KEY" => {
                let key = arg(args, 1, "NUMAMIGRATE KEY <key> <target_node>")?;
                let node = self.node(arg(args, 2, "NUMAMIGRATE KEY <key> <target_node>")?)?;
                self.ctx.engine().migrate_key(key.as_bytes(), node)?;
                Ok(Reply::Ok)
            }
            "DB" => {
                let node = self.node(arg(args, 1, "NUMAMIGRATE DB <target_node>")?)?;
                Ok(self.ctx.engine().migrate_all(node).into())
            }
            "BATCH" => {
                let usage = "NUMAMIGRATE BATCH <target_node> <key> [<key> ...]";
                let node = self.node(arg(args, 1, usage)?)?;
                arg(args, 2, usage)?;
                let keys: Vec<Vec<u8>> = args[2..].iter().map(|k| k.as_bytes().to_vec()).collect();
                Ok(self.ctx.engine().migrate_batch(&keys, node).into())
            }
            "PATTERN" => {
                let usage = "NUMAMIGRATE PATTERN <pattern> <target_node>";
                let pattern = arg(args, 1, usage)?;
                let node = self.node(arg(args, 2, usage)?)?;
                Ok(self.ctx.engine().migrate_pattern(pattern.as_bytes(), node).into())
            }
            "HOT" => {
                let key = arg(args, 1, "NUMAMIGRATE HOT <key>")?;
                self.ctx.mark_hot(key.as_bytes())?;
                Ok(Reply::Ok)
            }
            "COLD" => {
                let key = arg(args, 1, "NUMAMIGRATE COLD <key>")?;
                self.ctx.mark_cold(key.as_bytes())?;
                Ok(Reply::Ok)
            }
            "STATS" => {
                let stats = self.ctx.engine().stats();
                Ok(Reply::map([
                    ("total_migrations", Reply::Integer(stats.total as i64)),
                    ("successful_migrations", Reply::Integer(stats.successful as i64)),
                    ("failed_migrations", Reply::Integer(stats.failed as i64)),
                    ("timed_out_migrations", Reply::Integer(stats.timeouts as i64)),
                    ("total_bytes_migrated", Reply::Integer(stats.bytes_migrated as i64)),
                    ("total_migration_time_us", Reply::Integer(stats.time_us as i64)),
                    ("peak_concurrent_migrations", Reply::Integer(stats.peak_concurrent as i64)),
                ]))
            }
            "RESET" => {
                self.ctx.engine().reset_stats();
                Ok(Reply::Ok)
            }
            "INFO" => {
                let key = arg(args, 1, "NUMAMIGRATE INFO <key>")?;
                let info = self.ctx.key_info(key.as_bytes())?;
                Ok(Reply::map([
                    ("type", Reply::Bulk(info.kind.to_string())),
                    ("encoding", Reply::Bulk(info.encoding.to_string())),
                    ("current_node", Reply::Integer(info.current_node.map_or(-1, i64::from))),
                    ("hotness_level", Reply::Integer(info.hotness.into())),
                    ("access_count", Reply::Integer(info.access_count as i64)),
                    ("numa_nodes_available", Reply::Integer(info.numa_nodes_available as i64)),
                    ("current_cpu_node", Reply::Integer(info.current_cpu_node.into())),
                ]))
            }
            "HELP" => Ok(Reply::lines(MIGRATE_HELP)),
            other => Err(unknown_subcommand(other, "NUMAMIGRATE")),
        }
    }

    fn numa_config(&self, args: &[&str]) -> Result<Reply> {
        let placement = self.ctx.placement();
        let sub = subcommand(args, "NUMACONFIG")?;
        match sub.as_str() {
            "GET" => {
                let config = placement.config();
                let weights = config
                    .node_weights
                    .iter()
                    .enumerate()
                    .map(|(node, &w)| Reply::Array(vec![Reply::Integer(node as i64), Reply::Integer(w.into())]))
                    .collect();
                Ok(Reply::map([
                    ("strategy", Reply::Bulk(config.strategy.to_string())),
                    ("nodes", Reply::Integer(self.ctx.node_count() as i64)),
                    (
                        "balance_threshold",
                        Reply::Integer((config.balance_threshold * 100.0).round() as i64),
                    ),
                    ("auto_rebalance", Reply::Bulk(yes_no(config.auto_rebalance).to_string())),
                    (
                        "cxl_optimization",
                        Reply::Bulk(
                            if config.cxl_optimization_enabled { "enabled" } else { "disabled" }.to_string(),
                        ),
                    ),
                    ("rebalance_interval", Reply::Integer(config.rebalance_interval_micros as i64)),
                    (
                        "min_allocation_size",
                        Reply::Integer(config.min_allocation_size_for_remote as i64),
                    ),
                    ("node_weights", Reply::Array(weights)),
                ]))
            }
            "SET" => {
                let usage = "NUMACONFIG SET <parameter> <value>";
                let param = arg(args, 1, usage)?;
                let value = arg(args, 2, usage)?;
                match param.to_ascii_lowercase().as_str() {
                    "strategy" => placement.set_strategy(value.parse::<Strategy>()?),
                    "cxl_optimization" => placement.set_cxl_optimization(truthy(value)),
                    "balance_threshold" => {
                        let percent: u32 = parse(value, "balance threshold")?;
                        if percent > 100 {
                            return Err(Error::InvalidArgument(
                                "balance threshold must be between 0 and 100".to_string(),
                            ));
                        }
                        placement.set_balance_threshold(percent as f64 / 100.0)?;
                    }
                    "weight" => {
                        let usage = "NUMACONFIG SET weight <node> <weight>";
                        let node = self.node(value)?;
                        let weight: u32 = parse(arg(args, 3, usage)?, "weight")?;
                        if weight > MAX_WEIGHT {
                            return Err(Error::InvalidArgument(format!(
                                "weight must be between 0 and {}",
                                MAX_WEIGHT
                            )));
                        }
                        placement.set_weight(node, weight)?;
                    }
                    other => {
                        return Err(Error::InvalidArgument(format!("unknown parameter: {}", other)))
                    }
                }
                Ok(Reply::Ok)
            }
            "REBALANCE" => match placement.trigger_rebalance() {
                Some(plan) => Ok(Reply::map([
                    ("from", Reply::Integer(plan.from.into())),
                    ("to", Reply::Integer(plan.to.into())),
                    ("spread", Reply::Bulk(format!("{:.3}", plan.spread))),
                ])),
                None => Ok(Reply::Ok),
            },
            "STATS" => Ok(Reply::from_serialize(&placement.stats())),
            "HELP" => Ok(Reply::lines(CONFIG_HELP)),
            other => Err(unknown_subcommand(other, "NUMACONFIG")),
        }
    }

    fn numa_slot(&self, args: &[&str]) -> Result<Reply> {
        let scheduler = self.ctx.scheduler();
        let sub = subcommand(args, "NUMASLOT")?;
        match sub.as_str() {
            "LIST" => Ok(Reply::Array(
                scheduler
                    .list()
                    .into_iter()
                    .map(|s| {
                        Reply::Bulk(format!(
                            "{}: {} ({}, priority {}, every {}ms)",
                            s.slot,
                            s.name,
                            if s.enabled { "enabled" } else { "disabled" },
                            s.priority,
                            s.interval_ms
                        ))
                    })
                    .collect(),
            )),
            "STATUS" => {
                let id = slot(arg(args, 1, "NUMASLOT STATUS <slot>")?)?;
                Ok(Reply::from_serialize(&scheduler.status(id)?))
            }
            "ENABLE" => {
                scheduler.enable(slot(arg(args, 1, "NUMASLOT ENABLE <slot>")?)?)?;
                Ok(Reply::Ok)
            }
            "DISABLE" => {
                scheduler.disable(slot(arg(args, 1, "NUMASLOT DISABLE <slot>")?)?)?;
                Ok(Reply::Ok)
            }
            "INSERT" => {
                let usage = "NUMASLOT INSERT <slot> <policy>";
                let id = slot(arg(args, 1, usage)?)?;
                scheduler.insert(id, arg(args, 2, usage)?)?;
                Ok(Reply::Ok)
            }
            "REMOVE" => {
                scheduler.remove(slot(arg(args, 1, "NUMASLOT REMOVE <slot>")?)?)?;
                Ok(Reply::Ok)
            }
            "CONFIG" => {
                let usage = "NUMASLOT CONFIG <slot> <key> [<value>]";
                let id = slot(arg(args, 1, usage)?)?;
                let key = arg(args, 2, usage)?;
                match args.get(3) {
                    Some(value) => {
                        scheduler.configure(id, key, value)?;
                        Ok(Reply::Ok)
                    }
                    None => Ok(Reply::Bulk(scheduler.get_config(id, key)?)),
                }
            }
            "RUN" => {
                let id = slot(arg(args, 1, "NUMASLOT RUN <slot>")?)?;
                let ran = scheduler.run_slot(id)?;
                Ok(Reply::Integer(ran.into()))
            }
            "PRIORITY" => {
                let usage = "NUMASLOT PRIORITY <slot> <low|normal|high>";
                let id = slot(arg(args, 1, usage)?)?;
                scheduler.set_priority(id, arg(args, 2, usage)?.parse::<Priority>()?)?;
                Ok(Reply::Ok)
            }
            "INTERVAL" => {
                let usage = "NUMASLOT INTERVAL <slot> <milliseconds>";
                let id = slot(arg(args, 1, usage)?)?;
                let ms: u64 = parse(arg(args, 2, usage)?, "interval")?;
                scheduler.set_interval(id, Duration::from_millis(ms))?;
                Ok(Reply::Ok)
            }
            "HELP" => Ok(Reply::lines(SLOT_HELP)),
            other => Err(unknown_subcommand(other, "NUMASLOT")),
        }
    }

    /// Parses a node id and checks it against the topology.
    fn node(&self, text: &str) -> Result<NodeId> {
        let nodes = self.ctx.node_count();
        let node: i64 = parse(text, "node")?;
        if node < 0 || node as usize >= nodes {
            return Err(Error::InvalidArgument(format!(
                "target node {} out of range (0-{})",
                node,
                nodes - 1
            )));
        }
        Ok(node as NodeId)
    }
}

fn subcommand(args: &[&str], command: &str) -> Result<String> {
    args.first()
        .map(|s| s.to_ascii_uppercase())
        .ok_or_else(|| Error::InvalidArgument(format!("wrong number of arguments for '{}'", command)))
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &str) -> Result<&'a str> {
    args.get(index)
        .copied()
        .ok_or_else(|| Error::InvalidArgument(format!("usage: {}", usage)))
}

fn parse<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid {} '{}'", what, text)))
}

fn slot(text: &str) -> Result<usize> {
    parse(text, "slot")
}

fn unknown_subcommand(sub: &str, command: &str) -> Error {
    Error::InvalidArgument(format!("unknown subcommand '{}'. Try {} HELP.", sub, command))
}

fn truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("yes")
        || value.parse::<i64>().is_ok_and(|n| n != 0)
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NumaConfig;
    use crate::numa::SimulatedTopology;
    use crate::value::PlainValue;

    fn dispatcher() -> CommandDispatcher {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 24));
        let ctx = NumaContext::with_clock(NumaConfig::default(), topo, Arc::new(ManualClock::new(0))).unwrap();
        ctx.store_on(b"user:1", &PlainValue::Bytes(b"alice".to_vec()), 0).unwrap();
        ctx.store_on(b"user:2", &PlainValue::Bytes(b"bob".to_vec()), 0).unwrap();
        ctx.store_on(b"count", &PlainValue::Bytes(b"42".to_vec()), 0).unwrap();
        CommandDispatcher::new(ctx)
    }

    #[test]
    fn test_migrate_key_and_info() {
        let d = dispatcher();
        assert_eq!(d.execute_line("numamigrate key user:1 1"), Reply::Ok);

        let info = d.execute_line("NUMAMIGRATE INFO user:1");
        assert_eq!(info.field("type").and_then(Reply::as_str), Some("string"));
        assert_eq!(info.field("current_node").and_then(Reply::as_integer), Some(1));
        assert_eq!(info.field("numa_nodes_available").and_then(Reply::as_integer), Some(2));

        let int = d.execute_line("NUMAMIGRATE INFO count");
        assert_eq!(int.field("current_node").and_then(Reply::as_integer), Some(-1));
    }

    #[test]
    fn test_migrate_errors_are_replies() {
        let d = dispatcher();
        match d.execute_line("NUMAMIGRATE KEY user:1 7") {
            Reply::Error(e) => assert!(e.starts_with("ERR invalid-argument: target node 7")),
            other => panic!("unexpected reply {:?}", other),
        }
        match d.execute_line("NUMAMIGRATE KEY nope 1") {
            Reply::Error(e) => assert!(e.starts_with("ERR not-found")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(d.execute_line("NUMAMIGRATE KEY user:1").is_error());
        assert!(d.execute_line("NUMAMIGRATE FROB").is_error());
        assert!(d.execute_line("NUMAMIGRATE").is_error());
        assert!(d.execute_line("").is_error());
        assert!(d.execute_line("GET user:1").is_error());
    }

    #[test]
    fn test_batch_pattern_db_and_stats() {
        let d = dispatcher();
        let batch = d.execute_line("NUMAMIGRATE BATCH 1 user:1 missing");
        assert_eq!(batch.field("succeeded").and_then(Reply::as_integer), Some(1));
        assert_eq!(batch.field("failed").and_then(Reply::as_integer), Some(1));

        let pattern = d.execute_line("NUMAMIGRATE PATTERN user:? 0");
        assert_eq!(pattern.field("succeeded").and_then(Reply::as_integer), Some(2));

        let db = d.execute_line("NUMAMIGRATE DB 1");
        assert_eq!(db.field("succeeded").and_then(Reply::as_integer), Some(3));

        let stats = d.execute_line("NUMAMIGRATE STATS");
        assert_eq!(stats.field("successful_migrations").and_then(Reply::as_integer), Some(6));

        assert_eq!(d.execute_line("NUMAMIGRATE RESET"), Reply::Ok);
        let stats = d.execute_line("NUMAMIGRATE STATS");
        assert_eq!(stats.field("total_migrations").and_then(Reply::as_integer), Some(0));
    }

    #[test]
    fn test_hot_and_cold() {
        let d = dispatcher();
        assert_eq!(d.execute_line("NUMAMIGRATE COLD user:2"), Reply::Ok);
        let info = d.execute_line("NUMAMIGRATE INFO user:2");
        assert_eq!(info.field("current_node").and_then(Reply::as_integer), Some(1));
        assert_eq!(info.field("hotness_level").and_then(Reply::as_integer), Some(0));

        assert_eq!(d.execute_line("NUMAMIGRATE HOT user:2"), Reply::Ok);
        let info = d.execute_line("NUMAMIGRATE INFO user:2");
        assert_eq!(info.field("current_node").and_then(Reply::as_integer), Some(0));
        assert_eq!(info.field("hotness_level").and_then(Reply::as_integer), Some(7));
    }

    #[test]
    fn test_config_get_and_set() {
        let d = dispatcher();
        assert_eq!(d.execute_line("NUMACONFIG SET strategy weighted"), Reply::Ok);
        assert_eq!(d.execute_line("NUMACONFIG SET weight 1 250"), Reply::Ok);
        assert_eq!(d.execute_line("NUMACONFIG SET balance_threshold 40"), Reply::Ok);
        assert_eq!(d.execute_line("NUMACONFIG SET cxl_optimization on"), Reply::Ok);

        let get = d.execute_line("NUMACONFIG GET");
        assert_eq!(get.field("strategy").and_then(Reply::as_str), Some("weighted"));
        assert_eq!(get.field("balance_threshold").and_then(Reply::as_integer), Some(40));
        assert_eq!(get.field("cxl_optimization").and_then(Reply::as_str), Some("enabled"));
        assert_eq!(
            get.field("node_weights"),
            Some(&Reply::Array(vec![
                Reply::Array(vec![Reply::Integer(0), Reply::Integer(100)]),
                Reply::Array(vec![Reply::Integer(1), Reply::Integer(250)]),
            ]))
        );

        assert!(d.execute_line("NUMACONFIG SET weight 1 1001").is_error());
        assert!(d.execute_line("NUMACONFIG SET weight 9 10").is_error());
        assert!(d.execute_line("NUMACONFIG SET balance_threshold 101").is_error());
        assert!(d.execute_line("NUMACONFIG SET strategy fastest").is_error());
        assert!(d.execute_line("NUMACONFIG SET colour blue").is_error());
        assert_eq!(d.execute_line("NUMACONFIG HELP"), Reply::lines(CONFIG_HELP));
    }

    #[test]
    fn test_config_stats_serializes_policy_counters() {
        let d = dispatcher();
        let stats = d.execute_line("NUMACONFIG STATS");
        assert!(matches!(stats.field("nodes"), Some(Reply::Array(nodes)) if nodes.len() == 2));
    }

    #[test]
    fn test_slot_commands() {
        let d = dispatcher();
        let list = d.execute_line("NUMASLOT LIST");
        assert!(matches!(&list, Reply::Array(slots) if slots.len() == 2));

        assert_eq!(d.execute_line("NUMASLOT INSERT 4 noop"), Reply::Ok);
        assert!(d.execute_line("NUMASLOT INSERT 4 noop").is_error());
        assert_eq!(d.execute_line("NUMASLOT RUN 4"), Reply::Integer(1));
        assert_eq!(d.execute_line("NUMASLOT CONFIG 4 executions"), Reply::Bulk("1".to_string()));

        assert_eq!(d.execute_line("NUMASLOT DISABLE 4"), Reply::Ok);
        assert!(d.execute_line("NUMASLOT RUN 4").is_error());
        assert_eq!(d.execute_line("NUMASLOT ENABLE 4"), Reply::Ok);

        assert_eq!(d.execute_line("NUMASLOT CONFIG 1 migrate_threshold 6"), Reply::Ok);
        assert_eq!(d.execute_line("NUMASLOT CONFIG 1 migrate_threshold"), Reply::Bulk("6".to_string()));

        let status = d.execute_line("NUMASLOT STATUS 4");
        assert_eq!(status.field("name").and_then(Reply::as_str), Some("noop"));
        assert_eq!(status.field("executions").and_then(Reply::as_integer), Some(1));

        assert_eq!(d.execute_line("NUMASLOT REMOVE 4"), Reply::Ok);
        assert!(d.execute_line("NUMASLOT REMOVE 0").is_error());
        assert!(d.execute_line("NUMASLOT STATUS 99").is_error());
    }

    #[test]
    fn test_reply_rendering() {
        let reply = Reply::map([("a", Reply::Integer(1)), ("b", Reply::Array(vec![Reply::Ok]))]);
        assert_eq!(reply.to_string(), "a:\n  (integer) 1\nb:\n  1)\n    OK\n");
        assert_eq!(reply.to_json(), serde_json::json!({ "a": 1, "b": ["OK"] }));
    }
}
