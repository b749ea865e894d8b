//! Pure retry policy for connect cycles
//!
//! A connect cycle makes one initial attempt plus `max_retries` retries. The
//! delay before retry `n` doubles from `initial_delay_ms` and is capped at
//! `max_delay_ms`.

use crate::config::ReconnectSection;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 250,
            max_delay_ms: 8000,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_retries: section.max_retries,
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Total attempts in one connect cycle
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given retry (1-based), doubling up to the cap
    pub fn calculate_backoff_delay(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Worst-case time one connect cycle spends sleeping
    pub fn calculate_max_total_delay(&self) -> u64 {
        (1..=self.max_retries)
            .map(|retry| self.calculate_backoff_delay(retry))
            .fold(0u64, u64::saturating_add)
    }
}

/// Decision after a failed connection attempt
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// Sleep `delay_ms`, then make attempt number `attempt`
    Retry { attempt: u32, delay_ms: u64 },
    /// Abort - shutdown requested
    AbortShutdownRequested,
    /// Abort - every attempt of the cycle failed
    AbortExhausted,
}

/// Pure retry decision logic
pub struct ReconnectPolicy;

impl ReconnectPolicy {
    /// Decide what follows failed attempt number `failed_attempt` (1-based)
    pub fn after_failure(
        failed_attempt: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> RetryDecision {
        if shutdown_requested {
            return RetryDecision::AbortShutdownRequested;
        }

        if failed_attempt >= config.max_attempts() {
            return RetryDecision::AbortExhausted;
        }

        RetryDecision::Retry {
            attempt: failed_attempt + 1,
            delay_ms: config.calculate_backoff_delay(failed_attempt),
        }
    }
}
