//! Empty-poll backoff
//!
//! Tracks consecutive empty polls per processor. Below the threshold every
//! tick runs; at or above it a skip budget grows by the multiplier per
//! further empty poll and ticks no-op until the budget is spent, capped so
//! the effective interval never exceeds the configured maximum. Any
//! non-empty cycle or error resets the state.

use std::time::Duration;

use super::config::BackoffConfig;

/// Read-only view of a processor's backoff state
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackoffSnapshot {
    pub consecutive_empty: u32,
    pub skip_budget: u32,
    pub skips_remaining: u32,
    pub active: bool,
}

/// Mutable backoff state for one processor
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    polling_interval: Duration,
    consecutive_empty: u32,
    skip_budget: u32,
    skips_remaining: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig, polling_interval: Duration) -> Self {
        Self {
            config,
            polling_interval,
            consecutive_empty: 0,
            skip_budget: 0,
            skips_remaining: 0,
        }
    }

    /// Decide whether this tick runs a cycle; skipped ticks consume budget
    pub fn should_run(&mut self) -> bool {
        if !self.config.enabled {
            return true;
        }
        if self.skips_remaining > 0 {
            self.skips_remaining -= 1;
            return false;
        }
        true
    }

    /// Record an empty cycle
    pub fn record_empty(&mut self) {
        if !self.config.enabled {
            return;
        }
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        if self.consecutive_empty < self.config.threshold {
            return;
        }
        let grown = self
            .skip_budget
            .max(1)
            .saturating_mul(self.config.multiplier);
        self.skip_budget = grown.min(self.max_skips());
        self.skips_remaining = self.skip_budget;
    }

    /// Reset after a non-empty cycle or an error
    pub fn reset(&mut self) {
        self.consecutive_empty = 0;
        self.skip_budget = 0;
        self.skips_remaining = 0;
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        BackoffSnapshot {
            consecutive_empty: self.consecutive_empty,
            skip_budget: self.skip_budget,
            skips_remaining: self.skips_remaining,
            active: self.skip_budget > 0,
        }
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }

    // Largest skip budget whose effective interval stays at or below the
    // configured maximum: (skips + 1) * polling_interval <= max_interval.
    fn max_skips(&self) -> u32 {
        let polling_ms = self.polling_interval.as_millis().max(1);
        let max_ms = self.config.max_interval.as_millis();
        ((max_ms / polling_ms).saturating_sub(1)).min(u32::MAX as u128) as u32
    }
}
