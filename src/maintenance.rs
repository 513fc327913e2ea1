//! Periodic maintenance thread.
//!
//! Runs one scheduling round and a pool compaction every maintenance
//! interval until stopped. Stopping wakes the thread immediately.

use crate::context::NumaContext;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
    ticks: AtomicU64,
}

/// Handle to the running maintenance thread; dropping it stops the thread.
pub struct Maintenance {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Maintenance {
    /// Starts the thread with the configured maintenance interval.
    pub fn spawn(ctx: Arc<NumaContext>) -> Result<Self> {
        let interval = ctx.config().scheduler.maintenance_interval();
        Self::spawn_with_interval(ctx, interval)
    }

    pub fn spawn_with_interval(ctx: Arc<NumaContext>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidArgument(
                "maintenance interval must be positive".to_string(),
            ));
        }
        let signal = Arc::new(Signal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            ticks: AtomicU64::new(0),
        });

        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name("numakv-maintenance".to_string())
            .spawn(move || run(ctx, thread_signal, interval))
            .map_err(|e| Error::Internal(format!("failed to spawn maintenance thread: {}", e)))?;

        info!("Maintenance thread started (interval {:?})", interval);
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Completed maintenance passes
    pub fn ticks(&self) -> u64 {
        self.signal.ticks.load(Ordering::Acquire)
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Maintenance thread panicked");
            }
            info!("Maintenance thread stopped after {} pass(es)", self.ticks());
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(ctx: Arc<NumaContext>, signal: Arc<Signal>, interval: Duration) {
    let mut stopped = signal.stopped.lock();
    while !*stopped {
        signal.wake.wait_for(&mut stopped, interval);
        if *stopped || !ctx.is_running() {
            break;
        }

        // Policies take their own locks.
        let report = parking_lot::MutexGuard::unlocked(&mut stopped, || ctx.run_maintenance());
        signal.ticks.fetch_add(1, Ordering::AcqRel);
        if report.compaction.chunks_released > 0 {
            debug!(
                policies = report.policies_run,
                chunks_released = report.compaction.chunks_released,
                "Maintenance pass"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::NumaConfig;
    use crate::numa::SimulatedTopology;
    use std::time::Instant;

    fn context() -> Arc<NumaContext> {
        let topo = Arc::new(SimulatedTopology::new(2, 1 << 20));
        NumaContext::with_clock(NumaConfig::default(), topo, Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn test_runs_until_stopped() {
        let ctx = context();
        let mut maintenance = Maintenance::spawn_with_interval(ctx.clone(), Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while maintenance.ticks() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(maintenance.ticks() >= 3);
        assert!(ctx.scheduler().rounds() >= 3);

        maintenance.stop();
        let after = maintenance.ticks();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(maintenance.ticks(), after);
    }

    #[test]
    fn test_stop_wakes_long_interval() {
        let ctx = context();
        let start = Instant::now();
        let maintenance = Maintenance::spawn_with_interval(ctx, Duration::from_secs(3600)).unwrap();
        drop(maintenance);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(Maintenance::spawn_with_interval(context(), Duration::ZERO).is_err());
    }
}
