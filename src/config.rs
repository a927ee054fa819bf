//! Mesh service configuration
//!
//! Tunables for the packet pipeline, caches and the retry scheduler.
//! Defaults match the values the protocol was deployed with.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Battery-aware operating mode
///
/// Affects the cover-traffic gate, the store-and-forward cache TTL and the
/// scan-interval advice handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryMode {
    Normal,
    Low,
    UltraLow,
}

impl BatteryMode {
    /// Divisor applied to the message cache TTL
    pub fn cache_ttl_divisor(&self) -> u32 {
        match self {
            BatteryMode::Normal => 1,
            BatteryMode::Low => 2,
            BatteryMode::UltraLow => 4,
        }
    }

    /// Multiplier advised to the transport for its scan interval
    pub fn scan_interval_multiplier(&self) -> u32 {
        match self {
            BatteryMode::Normal => 1,
            BatteryMode::Low | BatteryMode::UltraLow => 3,
        }
    }
}

/// Retry scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of resend attempts before giving up
    pub max_retries: u32,
    /// Delay before the first resend
    pub initial_backoff: Duration,
    /// Growth factor applied per attempt
    pub backoff_factor: f64,
    /// Ceiling on any single backoff interval
    pub max_backoff: Duration,
    /// Total time budget for one entry
    pub max_retry_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(5),
            backoff_factor: 1.5,
            max_backoff: Duration::from_secs(120),
            max_retry_time: Duration::from_secs(30 * 60),
        }
    }
}

/// Configuration for the mesh service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Display name announced to peers
    pub nickname: String,
    /// Directory holding the persisted identity keys
    pub data_dir: PathBuf,
    /// TTL stamped on locally originated packets with no TTL set
    pub default_ttl: u8,
    /// Capacity of the incoming and outgoing packet queues
    pub queue_capacity: usize,
    /// Store-and-forward cache entry cap
    pub cache_size: usize,
    /// Store-and-forward cache TTL in Normal battery mode
    pub cache_ttl: Duration,
    /// Deduplication window for the seen set
    pub seen_ttl: Duration,
    /// Fragment reassembly slot timeout
    pub fragment_timeout: Duration,
    /// Delay between fragments of one burst
    pub fragment_pacing: Duration,
    /// Maintenance loop tick interval
    pub maintenance_interval: Duration,
    /// Egress drain deadline during shutdown
    pub shutdown_drain: Duration,
    /// Whether to emit cover traffic
    pub cover_traffic: bool,
    /// Per-tick probability of a cover packet, 0-100
    pub cover_traffic_probability: u32,
    /// Battery-aware operating mode at startup
    pub battery_mode: BatteryMode,
    /// Retry scheduler tuning
    pub retry: RetryConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            data_dir: PathBuf::from(".bitchat"),
            default_ttl: 7,
            queue_capacity: 100,
            cache_size: 1000,
            cache_ttl: Duration::from_secs(5 * 60),
            seen_ttl: Duration::from_secs(5 * 60),
            fragment_timeout: Duration::from_secs(30),
            fragment_pacing: Duration::from_millis(20),
            maintenance_interval: Duration::from_secs(60),
            shutdown_drain: Duration::from_millis(500),
            cover_traffic: true,
            cover_traffic_probability: 10,
            battery_mode: BatteryMode::Normal,
            retry: RetryConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Cache TTL adjusted for the given battery mode
    pub fn effective_cache_ttl(&self, mode: BatteryMode) -> Duration {
        self.cache_ttl / mode.cache_ttl_divisor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.default_ttl, 7);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.backoff_factor, 1.5);
    }

    #[test]
    fn test_battery_scaling() {
        let config = MeshConfig::default();
        assert_eq!(
            config.effective_cache_ttl(BatteryMode::Normal),
            Duration::from_secs(300)
        );
        assert_eq!(
            config.effective_cache_ttl(BatteryMode::Low),
            Duration::from_secs(150)
        );
        assert_eq!(
            config.effective_cache_ttl(BatteryMode::UltraLow),
            Duration::from_secs(75)
        );
        assert_eq!(BatteryMode::UltraLow.scan_interval_multiplier(), 3);
    }
}
