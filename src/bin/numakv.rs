//! numakv command-line tool
//!
//! Inspects the host topology, prints the effective configuration, runs
//! control commands and drives a synthetic placement/migration workload.
//!
//! # Examples
//!
//! ```bash
//! # Show detected memory nodes and distances
//! numakv info
//!
//! # Effective configuration (defaults + file + NUMAKV__* environment)
//! numakv --config numakv.toml config --format json
//!
//! # Synthetic workload on a simulated four-node machine
//! numakv bench --simulated 4 --keys 20000 --rounds 5
//!
//! # One control command against a fresh simulated context
//! numakv exec --simulated 2 NUMACONFIG GET
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use numakv::command::CommandDispatcher;
use numakv::numa::with_current_node;
use numakv::{NodeId, NodeMemory, NumaConfig, NumaContext, PlainValue, SimulatedTopology, SystemTopology};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// NUMA-aware memory placement and value migration
#[derive(Parser, Debug)]
#[command(name = "numakv")]
#[command(version = numakv::VERSION)]
#[command(about = "NUMA-aware memory placement and value migration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "NUMAKV_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory; file logging is off when unset
    #[arg(long, global = true, env = "NUMAKV_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the memory topology
    Info(TopologyArgs),

    /// Print the effective configuration
    Config {
        #[arg(long, value_enum, default_value = "toml")]
        format: Format,
    },

    /// Run a synthetic allocation, access and migration workload
    Bench(BenchArgs),

    /// Execute one control command (NUMAMIGRATE, NUMACONFIG, NUMASLOT)
    Exec {
        #[command(flatten)]
        topology: TopologyArgs,

        /// Command words, e.g. `NUMASLOT LIST`
        #[arg(required = true, trailing_var_arg = true)]
        words: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Toml,
    Json,
}

#[derive(Args, Debug, Clone)]
struct TopologyArgs {
    /// Use a simulated machine with this many nodes instead of the host
    #[arg(long)]
    simulated: Option<usize>,

    /// Capacity per simulated node in MiB
    #[arg(long, default_value = "1024")]
    node_capacity_mib: u64,
}

impl TopologyArgs {
    fn memory(&self) -> Arc<dyn NodeMemory> {
        match self.simulated {
            Some(nodes) => Arc::new(SimulatedTopology::new(nodes.max(1), self.node_capacity_mib << 20)),
            None => Arc::new(SystemTopology::detect()),
        }
    }
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[command(flatten)]
    topology: TopologyArgs,

    /// Number of keys to store
    #[arg(long, default_value = "10000")]
    keys: usize,

    /// Payload bytes per scalar value
    #[arg(long, default_value = "256")]
    value_size: usize,

    /// Accesses per key per round
    #[arg(long, default_value = "4")]
    accesses: usize,

    /// Maintenance rounds
    #[arg(long, default_value = "3")]
    rounds: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(&cli)?;

    let config = NumaConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Info(topology) => info_command(&topology),
        Commands::Config { format } => config_command(&config, format),
        Commands::Bench(args) => bench_command(config, &args),
        Commands::Exec { topology, words } => exec_command(config, &topology, &words),
    }
}

/// Installs console logging and, with `--log-dir`, a daily rolling file.
fn setup_logging(cli: &Cli) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    let (file_layer, guard) = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "numakv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let console = if cli.json_logs {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(!cli.no_color)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

fn info_command(topology: &TopologyArgs) -> anyhow::Result<()> {
    let memory = topology.memory();
    let nodes = memory.node_count();
    println!("numakv {}", numakv::VERSION);
    println!("Memory nodes: {}", nodes);
    println!("Current node: {}", memory.resolve_node(memory.current_node()));

    print!("Distances:\n     ");
    for to in 0..nodes {
        print!("{:>5}", to);
    }
    println!();
    for from in 0..nodes as NodeId {
        print!("{:>5}", from);
        for to in 0..nodes as NodeId {
            print!("{:>5}", memory.distance(from, to));
        }
        println!();
    }

    for node in 0..nodes as NodeId {
        let usage = memory.usage(node);
        println!(
            "Node {}: {} bytes used of {} ({:.1}%)",
            node,
            usage.used,
            usage.capacity,
            usage.utilization() * 100.0
        );
    }
    Ok(())
}

fn config_command(config: &NumaConfig, format: Format) -> anyhow::Result<()> {
    let rendered = match format {
        Format::Toml => config.to_toml()?,
        Format::Json => serde_json::to_string_pretty(config)?,
    };
    println!("{}", rendered);
    Ok(())
}

fn bench_command(config: NumaConfig, args: &BenchArgs) -> anyhow::Result<()> {
    let ctx = NumaContext::init(config, args.topology.memory()).context("Failed to initialize NUMA context")?;
    let nodes = ctx.node_count();
    info!(nodes, keys = args.keys, "Starting benchmark");

    let started = Instant::now();
    for i in 0..args.keys {
        ctx.store(format!("key:{}", i).as_bytes(), &sample_value(i, args.value_size))
            .with_context(|| format!("Failed to store key:{}", i))?;
    }
    let store_elapsed = started.elapsed();

    let access_started = Instant::now();
    let mut scheduled = 0usize;
    for round in 0..args.rounds {
        for i in 0..args.keys {
            let key = format!("key:{}", i);
            // Skewed workload: every fourth key is read mostly from the next node
            let node = (if i % 4 == 0 { (i / 4 + 1) % nodes } else { i % nodes }) as NodeId;
            with_current_node(node, || {
                for _ in 0..args.accesses {
                    ctx.access(key.as_bytes());
                }
            });
        }
        scheduled += ctx
            .scheduler()
            .run_all_at(started + Duration::from_secs(round * 2 + 1));
        ctx.allocator().compact();
    }
    let access_elapsed = access_started.elapsed();

    let migrated = ctx.engine().stats();
    if migrated.failed > 0 {
        warn!("{} migration(s) failed during the benchmark", migrated.failed);
    }

    let mut timings = BTreeMap::new();
    timings.insert("store_ms", store_elapsed.as_millis() as u64);
    timings.insert("access_ms", access_elapsed.as_millis() as u64);
    timings.insert("policies_run", scheduled as u64);

    let report = serde_json::json!({
        "timings": timings,
        "stats": ctx.stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    ctx.shutdown();
    Ok(())
}

/// Mixes value kinds so every migration adapter gets exercised.
fn sample_value(i: usize, size: usize) -> PlainValue {
    match i % 5 {
        0 => PlainValue::Bytes(vec![b'x'; size]),
        1 => PlainValue::Bytes(i.to_string().into_bytes()),
        2 => PlainValue::Hash(
            (0..8)
                .map(|f| (format!("field{}", f).into_bytes(), vec![b'v'; size / 8 + 1]))
                .collect(),
        ),
        3 => PlainValue::List((0..16).map(|n| vec![n as u8; size / 16 + 1]).collect()),
        _ => PlainValue::Zset((0..16).map(|n| (format!("m{}", n).into_bytes(), n as f64)).collect()),
    }
}

fn exec_command(config: NumaConfig, topology: &TopologyArgs, words: &[String]) -> anyhow::Result<()> {
    let ctx = NumaContext::init(config, topology.memory()).context("Failed to initialize NUMA context")?;
    let dispatcher = CommandDispatcher::new(ctx.clone());
    let args: Vec<&str> = words.iter().map(String::as_str).collect();
    let reply = dispatcher.execute(&args);
    print!("{}", reply);
    ctx.shutdown();
    if reply.is_error() {
        anyhow::bail!("command failed");
    }
    Ok(())
}
