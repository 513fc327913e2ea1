//! Baseline policy in slot 0: does nothing but prove the scheduler runs.

use super::{Policy, PolicyContext, PolicyFactory, Priority};
use crate::config::NumaConfig;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

pub(super) const NAME: &str = "noop";

const LOG_EVERY: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct NoopPolicy {
    executions: u64,
    last_log: Option<Instant>,
}

pub(super) fn factory() -> PolicyFactory {
    PolicyFactory {
        name: NAME.to_string(),
        description: "Baseline no-op policy".to_string(),
        priority: Priority::Low,
        interval: Duration::from_secs(1),
        create: |_: &NumaConfig| -> Box<dyn Policy> { Box::new(NoopPolicy::default()) },
    }
}

impl Policy for NoopPolicy {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Baseline no-op policy"
    }

    fn execute(&mut self, _ctx: &PolicyContext, now: Instant) -> Result<()> {
        self.executions += 1;
        let quiet = self
            .last_log
            .is_some_and(|last| now.saturating_duration_since(last) < LOG_EVERY);
        if !quiet {
            debug!("No-op policy executed (count: {})", self.executions);
            self.last_log = Some(now);
        }
        Ok(())
    }

    fn get_config(&self, _ctx: &PolicyContext, key: &str) -> Result<String> {
        match key {
            "executions" => Ok(self.executions.to_string()),
            other => Err(Error::InvalidArgument(format!("noop has no option '{}'", other))),
        }
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "executions": self.executions })
    }
}
