//! Placement, hotness and scheduling scenarios

use numakv::clock::ManualClock;
use numakv::config::PolicyConfig;
use numakv::hotness::{HotnessTracker, MAX_HOTNESS};
use numakv::policy::{ConfigurableAllocationPolicy, Strategy};
use numakv::scheduler::Priority;
use numakv::{NodeAllocator, NumaConfig, NumaContext, PlainValue, SimulatedTopology};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn placement(nodes: usize, config: &PolicyConfig) -> ConfigurableAllocationPolicy {
    let topo = Arc::new(SimulatedTopology::new(nodes, 1 << 30));
    let alloc = NodeAllocator::new(topo, &Default::default());
    ConfigurableAllocationPolicy::new(alloc, config).unwrap()
}

#[test]
fn test_weighted_split_follows_weights() {
    let config = PolicyConfig {
        strategy: Strategy::Weighted,
        node_weights: vec![80, 20],
        ..PolicyConfig::default()
    };
    let policy = placement(2, &config);

    let mut counts = [0usize; 2];
    for _ in 0..10_000 {
        counts[policy.place(64) as usize] += 1;
    }
    assert_eq!(counts, [8000, 2000]);

    let stats = policy.stats();
    assert_eq!(stats.nodes[0].allocations, 8000);
    assert_eq!(stats.nodes[1].allocations, 2000);
    assert_eq!(stats.nodes[0].bytes, 8000 * 64);
}

#[test]
fn test_weight_change_takes_effect_immediately() {
    let config = PolicyConfig {
        strategy: Strategy::Weighted,
        node_weights: vec![50, 50, 0],
        ..PolicyConfig::default()
    };
    let policy = placement(3, &config);
    assert!((0..300).all(|_| policy.place(8) != 2));

    policy.set_weight(0, 0).unwrap();
    policy.set_weight(1, 0).unwrap();
    policy.set_weight(2, 10).unwrap();
    assert!((0..300).all(|_| policy.place(8) == 2));
}

#[test]
fn test_local_accesses_never_lower_hotness() {
    let clock = Arc::new(ManualClock::new(0));
    let tracker = HotnessTracker::new(&Default::default(), clock.clone());
    tracker.track(b"k", 0);

    let mut last = tracker.get(b"k").unwrap().hotness;
    for i in 0..20u16 {
        clock.advance(i * 100);
        tracker.record_access(b"k", 0);
        let now = tracker.get(b"k").unwrap().hotness;
        assert!(now >= last);
        assert!(now <= MAX_HOTNESS);
        last = now;
    }
    assert_eq!(last, MAX_HOTNESS);
}

#[test]
fn test_decay_alone_never_raises_hotness() {
    let clock = Arc::new(ManualClock::new(0));
    let tracker = HotnessTracker::new(&Default::default(), clock.clone());
    tracker.track(b"k", 0);
    tracker.set_hotness(b"k", MAX_HOTNESS);

    clock.set(20_000);
    let mut last = MAX_HOTNESS;
    for _ in 0..12 {
        tracker.decay();
        let now = tracker.get(b"k").map_or(0, |m| m.hotness);
        assert!(now <= last);
        last = now;
    }
    assert_eq!(last, 0);
}

fn context() -> (Arc<ManualClock>, Arc<NumaContext>) {
    let topo = Arc::new(SimulatedTopology::new(2, 1 << 26));
    let clock = Arc::new(ManualClock::new(0));
    let mut config = NumaConfig::default();
    config.policy.auto_rebalance = false;
    let ctx = NumaContext::with_clock(config, topo, clock.clone()).unwrap();
    (clock, ctx)
}

#[test]
fn test_idle_value_cools_under_maintenance() {
    let (clock, ctx) = context();
    ctx.store_on(b"k", &PlainValue::Bytes(b"value".to_vec()), 0).unwrap();
    ctx.tracker().set_hotness(b"k", 4);

    clock.set(20_000);
    let start = Instant::now();
    for round in 0..4u64 {
        // Decay runs at most once per decay interval
        ctx.scheduler()
            .run_all_at(start + Duration::from_secs(10 * round));
    }
    assert_eq!(ctx.tracker().get(b"k").unwrap().hotness, 0);
}

#[test]
fn test_slots_run_high_priority_first() {
    let (_clock, ctx) = context();
    let scheduler = ctx.scheduler();
    scheduler.insert(5, "noop").unwrap();
    scheduler.set_priority(5, Priority::High).unwrap();
    scheduler.set_priority(1, Priority::Low).unwrap();

    let start = Instant::now();
    assert_eq!(scheduler.run_all_at(start), 3);
    // Nothing is due again within the one-second interval
    assert_eq!(scheduler.run_all_at(start + Duration::from_millis(500)), 0);
    assert_eq!(scheduler.run_all_at(start + Duration::from_secs(1)), 3);

    let status = scheduler.status(5).unwrap();
    assert_eq!(status.executions, 2);
    assert_eq!(status.priority, Priority::High);
    assert_eq!(scheduler.rounds(), 3);
}

#[test]
fn test_config_file_drives_context() {
    let path = std::env::temp_dir().join(format!("numakv-policy-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
[policy]
strategy = "round-robin"
auto_rebalance = false

[hotness]
migrate_threshold = 6

[migration]
hot_node = 1
"#,
    )
    .unwrap();

    let config = NumaConfig::load(Some(path.as_path())).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(config.policy.strategy, Strategy::RoundRobin);
    assert!(!config.policy.auto_rebalance);

    let topo = Arc::new(SimulatedTopology::new(2, 1 << 24));
    let ctx = NumaContext::init(config, topo).unwrap();
    assert_eq!(ctx.tracker().migrate_threshold(), 6);

    let first = ctx.store(b"a", &PlainValue::Bytes(b"1x".to_vec())).unwrap();
    let second = ctx.store(b"b", &PlainValue::Bytes(b"2x".to_vec())).unwrap();
    assert_ne!(first, second);

    let report = ctx.mark_hot(b"a").unwrap();
    assert_eq!(report.to, 1);
}

#[test]
fn test_size_threshold_sends_large_values_remote_by_default() {
    let config = PolicyConfig {
        strategy: Strategy::SizeThreshold,
        ..PolicyConfig::default()
    };
    assert!(!config.cxl_optimization_enabled);
    let policy = placement(2, &config);

    assert_eq!(policy.select_node(64), 0);
    assert_eq!(policy.select_node(config.min_allocation_size_for_remote), 1);
    assert_eq!(policy.select_node(1 << 20), 1);
}
