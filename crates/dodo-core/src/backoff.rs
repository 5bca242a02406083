//! Restart pacing for supervised background tasks.
//!
//! A task that keeps failing is restarted after `base_delay`, then after
//! `factor` times as long as the previous wait, never waiting longer than
//! `max_delay`. A task that stayed up for at least `max_delay` before it
//! failed is considered to have recovered, and its next restart starts the
//! schedule over.

use crate::config::SelectorConfig;
use rand::Rng;
use std::time::Duration;

/// Wait schedule between restarts of a failing task.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Wait before restart number zero.
    pub base_delay: Duration,
    /// Longest wait between restarts. Also the uptime that resets the schedule.
    pub max_delay: Duration,
    /// Growth per consecutive restart.
    pub factor: f64,
    /// Spread each wait over half to one and a half times its nominal value,
    /// so watchers sharing a registry do not reconnect in lockstep.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: SelectorConfig::WATCH_BACKOFF_BASE,
            max_delay: SelectorConfig::WATCH_BACKOFF_MAX,
            factor: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before restart number `restart`, counted from zero since the
    /// task last recovered.
    pub fn restart_delay(&self, restart: u32) -> Duration {
        let cap = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(restart).unwrap_or(i32::MAX);
        let nominal = (self.base_delay.as_secs_f64() * self.factor.powi(exponent)).min(cap);

        let secs = if self.jitter {
            (nominal * rand::rng().random_range(0.5..1.5)).min(cap)
        } else {
            nominal
        };
        Duration::from_secs_f64(secs)
    }

    /// Whether a task that ran for `uptime` before failing has recovered.
    pub fn recovered(&self, uptime: Duration) -> bool {
        uptime >= self.max_delay
    }
}
