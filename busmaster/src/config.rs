//! Subsystem configuration.
//!
//! Plain values fixed at init. Coalescing parameters are clamped rather
//! than rejected; everything else is checked by [`DmaConfig::validate`].

use dma_pool::{DEFAULT_POOL_ENTRIES, MAX_POOL_SIZE};

use crate::cache::{CacheTier, DEFAULT_FLUSH_THRESHOLD, DEFAULT_MAX_FLUSH_DELAY_MS};
use crate::completion::{COMPLETION_TIMEOUT_MS, DRAIN_BATCH};
use crate::error::{DmaError, Result};

/// Default bounce entry size: one full Ethernet frame plus slack.
pub const DEFAULT_BOUNCE_ENTRY_SIZE: usize = 1536;

/// Largest bounce entry: one 64K block.
pub const MAX_BOUNCE_ENTRY_SIZE: usize = 0x1_0000;

const MIN_BOUNCE_ENTRY_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaConfig {
    pub tx_bounce_entries: usize,
    pub rx_bounce_entries: usize,
    pub bounce_entry_size: usize,
    /// Force a cache tier instead of probing.
    pub cache_tier: Option<CacheTier>,
    pub coalescing: bool,
    pub flush_threshold: u32,
    pub max_flush_delay_ms: u32,
    pub completion_timeout_ms: u64,
    /// Completions unmapped per bottom-half pass.
    pub drain_batch: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self {
            tx_bounce_entries: DEFAULT_POOL_ENTRIES,
            rx_bounce_entries: DEFAULT_POOL_ENTRIES,
            bounce_entry_size: DEFAULT_BOUNCE_ENTRY_SIZE,
            cache_tier: None,
            coalescing: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_flush_delay_ms: DEFAULT_MAX_FLUSH_DELAY_MS,
            completion_timeout_ms: COMPLETION_TIMEOUT_MS,
            drain_batch: DRAIN_BATCH,
        }
    }
}

impl DmaConfig {
    pub fn with_pool_entries(mut self, tx: usize, rx: usize) -> Self {
        self.tx_bounce_entries = tx;
        self.rx_bounce_entries = rx;
        self
    }

    pub fn with_entry_size(mut self, size: usize) -> Self {
        self.bounce_entry_size = size;
        self
    }

    pub fn with_cache_tier(mut self, tier: CacheTier) -> Self {
        self.cache_tier = Some(tier);
        self
    }

    pub fn with_coalescing(mut self, enabled: bool, threshold: u32, max_delay_ms: u32) -> Self {
        self.coalescing = enabled;
        self.flush_threshold = threshold;
        self.max_flush_delay_ms = max_delay_ms;
        self
    }

    pub fn with_completion_timeout_ms(mut self, ms: u64) -> Self {
        self.completion_timeout_ms = ms;
        self
    }

    pub fn with_drain_batch(mut self, batch: usize) -> Self {
        self.drain_batch = batch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let pool_ok = |n: usize| (1..=MAX_POOL_SIZE).contains(&n);
        if !pool_ok(self.tx_bounce_entries) || !pool_ok(self.rx_bounce_entries) {
            return Err(DmaError::InvalidConfig("bounce pools need 1 to 32 entries each"));
        }
        if !(MIN_BOUNCE_ENTRY_SIZE..=MAX_BOUNCE_ENTRY_SIZE).contains(&self.bounce_entry_size) {
            return Err(DmaError::InvalidConfig("bounce entry size out of range"));
        }
        if self.completion_timeout_ms == 0 {
            return Err(DmaError::InvalidConfig("completion timeout must be non-zero"));
        }
        if self.drain_batch == 0 {
            return Err(DmaError::InvalidConfig("drain batch must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DmaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tx_bounce_entries, 16);
        assert_eq!(config.bounce_entry_size, 1536);
        assert_eq!(config.flush_threshold, 8);
        assert_eq!(config.max_flush_delay_ms, 50);
        assert_eq!(config.completion_timeout_ms, 5000);
        assert_eq!(config.drain_batch, 16);
    }

    #[test]
    fn test_validate_rejects() {
        let base = DmaConfig::default();
        assert!(base.with_pool_entries(0, 16).validate().is_err());
        assert!(base.with_pool_entries(16, 33).validate().is_err());
        assert!(base.with_entry_size(16).validate().is_err());
        assert!(base.with_entry_size(0x2_0000).validate().is_err());
        assert!(base.with_completion_timeout_ms(0).validate().is_err());
        assert!(base.with_drain_batch(0).validate().is_err());
        assert!(base.with_entry_size(0x1_0000).with_pool_entries(1, 1).validate().is_ok());
    }
}
