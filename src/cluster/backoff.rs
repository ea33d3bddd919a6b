//! Respawn pacing for a worker slot.

use std::time::Duration;

use rand::Rng;

use crate::config::ClusterConfig;

/// Per-slot respawn delay sequence.
///
/// Delays double from `base` up to `max`, each with up to 10% jitter so
/// crashed workers don't restart in lockstep. A worker that stayed up longer
/// than `max` starts the sequence over.
#[derive(Debug, Clone)]
pub struct RespawnBackoff {
    failures: u32,
    base: Duration,
    max: Duration,
}

impl RespawnBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: 0,
            base,
            max: max.max(base),
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.respawn_base_delay_ms),
            Duration::from_millis(config.respawn_max_delay_ms),
        )
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Note how long the last worker ran before exiting.
    pub fn observe_uptime(&mut self, uptime: Duration) {
        if uptime > self.max {
            self.failures = 0;
        }
    }

    /// Count one more failure and return the pause before the next spawn.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let step = self.ceiling();
        let spread = step.as_millis() as u64 / 10;
        if spread == 0 {
            return step;
        }
        step + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
    }

    /// Delay for the current failure count, before jitter.
    fn ceiling(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << doublings).min(self.max)
    }
}
