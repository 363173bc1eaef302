//! Feed configuration
//!
//! Every section deserializes with defaults so a partial JSON file only has
//! to name the knobs it changes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlickConfig {
    pub state_machine: StateMachineConfig,
    pub recovery: RecoveryConfig,
    pub controller: ControllerConfig,
    pub preload: PreloadConfig,
    pub pool: PoolConfig,
    pub memory: MemoryConfig,
    pub network: NetworkConfig,
    pub power: PowerConfig,
}

impl FlickConfig {
    /// Parse a configuration from JSON and validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FlickConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.pool.slot_count == 0 {
            return Err(Error::InvalidConfig("pool.slot_count must be at least 1".into()));
        }
        if self.preload.max_concurrent == 0 {
            return Err(Error::InvalidConfig("preload.max_concurrent must be at least 1".into()));
        }
        if self.preload.max_queue == 0 {
            return Err(Error::InvalidConfig("preload.max_queue must be at least 1".into()));
        }
        if self.memory.max_resident == 0 {
            return Err(Error::InvalidConfig("memory.max_resident must be at least 1".into()));
        }
        if self.memory.max_decoded > self.memory.max_resident {
            return Err(Error::InvalidConfig(format!(
                "memory.max_decoded ({}) exceeds memory.max_resident ({})",
                self.memory.max_decoded, self.memory.max_resident
            )));
        }
        if !(self.memory.ceiling_mb.is_finite() && self.memory.ceiling_mb > 0.0) {
            return Err(Error::InvalidConfig("memory.ceiling_mb must be positive and finite".into()));
        }
        if self.memory.sweep_interval_ms == 0 {
            return Err(Error::InvalidConfig("memory.sweep_interval_ms must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.controller.default_volume) {
            return Err(Error::InvalidConfig("controller.default_volume must be within 0..=1".into()));
        }
        if !(0.0..=1.0).contains(&self.power.low_level) || !(0.0..=1.0).contains(&self.power.recover_level) {
            return Err(Error::InvalidConfig("power levels must be within 0..=1".into()));
        }
        if self.power.recover_level < self.power.low_level {
            return Err(Error::InvalidConfig(
                "power.recover_level must not be below power.low_level".into(),
            ));
        }
        if !(self.network.slow_downlink_mbps.is_finite() && self.network.slow_downlink_mbps > 0.0) {
            return Err(Error::InvalidConfig(
                "network.slow_downlink_mbps must be positive and finite".into(),
            ));
        }
        Ok(())
    }
}

/// Playback state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Time spent buffering before the session is considered stalled
    pub stall_timeout_ms: u64,
}

impl StateMachineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 3_000,
        }
    }
}

/// Stream error recovery bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reload attempts after a fatal network error
    pub max_network_retries: u32,
    /// Decoder recovery cycles after a fatal media error
    pub max_decode_recoveries: u32,
    /// First retry delay, doubled per attempt
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay
    pub retry_max_delay_ms: u64,
}

impl RecoveryConfig {
    /// Backoff before the given retry attempt (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_network_retries: 3,
            max_decode_recoveries: 1,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 8_000,
        }
    }
}

/// Playback controller policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Pin the lowest quality while the network is slow
    pub auto_quality_on_network_change: bool,
    /// Pause when connectivity is lost, resume when it returns
    pub auto_pause_on_offline: bool,
    /// Pause on low battery, resume when charging
    pub auto_pause_on_low_battery: bool,
    /// Volume applied when the preference store has none
    pub default_volume: f64,
    /// Retry a blocked autoplay with audio muted
    pub muted_autoplay_fallback: bool,
    /// Publish analytics for each session
    pub analytics_enabled: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            auto_quality_on_network_change: true,
            auto_pause_on_offline: true,
            auto_pause_on_low_battery: true,
            default_volume: 1.0,
            muted_autoplay_fallback: true,
            analytics_enabled: true,
        }
    }
}

/// Preload scheduler limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Maximum number of queued tasks (pending and loading)
    pub max_queue: usize,
    /// Maximum fetches in flight
    pub max_concurrent: usize,
    /// Scroll velocity (items per second) above which preloading pauses
    pub velocity_threshold: f64,
    /// Bytes requested for a metadata preload
    pub metadata_bytes: u64,
    /// Bytes requested for a partial preload
    pub partial_bytes: u64,
    /// Timeout for a single preload request
    pub request_timeout_ms: u64,
}

impl PreloadConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_queue: 32,
            max_concurrent: 2,
            velocity_threshold: 3.0,
            metadata_bytes: 64 * 1024,
            partial_bytes: 1024 * 1024,
            request_timeout_ms: 10_000,
        }
    }
}

/// Engine pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of reusable engine slots
    pub slot_count: usize,
    /// Size of the virtual feed window; distances up to half of it keep
    /// metadata preloaded
    pub window: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slot_count: 5,
            window: 10,
        }
    }
}

/// Memory governor budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum videos with a mounted render surface
    pub max_resident: usize,
    /// Maximum videos holding decoded frames
    pub max_decoded: usize,
    /// Aggregate estimate above which memory is considered low
    pub ceiling_mb: f64,
    /// Estimated footprint of a video with decoded frames
    pub decoded_estimate_mb: f64,
    /// Estimated footprint of a mounted surface showing a thumbnail
    pub surface_estimate_mb: f64,
    /// Interval of the forced cleanup sweep
    pub sweep_interval_ms: u64,
}

impl MemoryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_resident: 5,
            max_decoded: 3,
            ceiling_mb: 150.0,
            decoded_estimate_mb: 30.0,
            surface_estimate_mb: 5.0,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Connectivity classification thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Downlink below which the connection counts as slow
    pub slow_downlink_mbps: f64,
    /// Round trip above which the connection counts as slow
    pub slow_rtt_ms: u32,
    /// Consecutive samples needed to switch between slow and fast
    pub hysteresis_samples: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            slow_downlink_mbps: 1.5,
            slow_rtt_ms: 600,
            hysteresis_samples: 2,
        }
    }
}

/// Battery thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Battery level (0..=1) at or below which power saving starts
    pub low_level: f64,
    /// Battery level at or above which power saving ends without charging
    pub recover_level: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            low_level: 0.20,
            recover_level: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlickConfig::default();
        assert_eq!(config.pool.slot_count, 5);
        assert_eq!(config.preload.max_concurrent, 2);
        assert_eq!(config.memory.ceiling_mb, 150.0);
        assert_eq!(config.state_machine.stall_timeout(), Duration::from_secs(3));
        assert_eq!(config.memory.sweep_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = FlickConfig::from_json_str(r#"{ "pool": { "slot_count": 7 } }"#).unwrap();
        assert_eq!(config.pool.slot_count, 7);
        assert_eq!(config.pool.window, 10);
        assert_eq!(config.recovery.max_network_retries, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = FlickConfig::from_json_str(r#"{ "memory": { "max_decoded": 9 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let err = FlickConfig::from_json_str(r#"{ "memory": { "sweep_interval_ms": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("sweep_interval_ms")));
    }

    #[test]
    fn test_non_finite_thresholds_rejected() {
        let mut config = FlickConfig::default();
        config.memory.ceiling_mb = f64::NAN;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = FlickConfig::default();
        config.memory.ceiling_mb = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = FlickConfig::default();
        config.network.slow_downlink_mbps = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = FlickConfig::default();
        config.power.low_level = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff() {
        let recovery = RecoveryConfig::default();
        assert_eq!(recovery.retry_delay(1), Duration::from_millis(500));
        assert_eq!(recovery.retry_delay(2), Duration::from_millis(1_000));
        assert_eq!(recovery.retry_delay(3), Duration::from_millis(2_000));
        assert_eq!(recovery.retry_delay(10), Duration::from_millis(8_000));
    }
}
