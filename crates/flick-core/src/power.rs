//! Power monitor
//!
//! Tracks battery level and charging state and derives a power-saving flag
//! with a small recovery margin so the flag does not flap around the
//! threshold. Without a battery probe the monitor stays neutral.

use crate::config::PowerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Raw reading from the platform battery probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// Battery level in `0.0..=1.0`
    pub level: f64,
    pub charging: bool,
}

impl PowerSample {
    pub fn new(level: f64, charging: bool) -> Self {
        Self { level, charging }
    }
}

/// Platform battery probe
pub trait PowerProbe: Send {
    /// Current reading, `None` if the platform exposes no battery API
    fn sample(&mut self) -> Option<PowerSample>;
}

/// Point-in-time power snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerInfo {
    /// `None` while the battery state is unknown
    pub level: Option<f64>,
    pub charging: Option<bool>,
    pub power_saving: bool,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl PowerInfo {
    pub fn is_known(&self) -> bool {
        self.level.is_some()
    }
}

/// Observes battery state
pub struct PowerMonitor {
    config: PowerConfig,
    probe: Option<Box<dyn PowerProbe>>,
    info: PowerInfo,
    tx: watch::Sender<PowerInfo>,
}

impl PowerMonitor {
    pub fn new(config: PowerConfig, probe: Option<Box<dyn PowerProbe>>) -> Self {
        let (tx, _) = watch::channel(PowerInfo::default());
        Self {
            config,
            probe,
            info: PowerInfo::default(),
            tx,
        }
    }

    pub fn info(&self) -> &PowerInfo {
        &self.info
    }

    pub fn is_power_saving(&self) -> bool {
        self.info.power_saving
    }

    pub fn subscribe(&self) -> watch::Receiver<PowerInfo> {
        self.tx.subscribe()
    }

    /// Read the probe and apply the sample; true if power saving toggled
    pub fn refresh(&mut self) -> bool {
        let sample = self.probe.as_mut().and_then(|probe| probe.sample());
        self.update(sample)
    }

    /// Apply a sample; true if power saving toggled
    pub fn update(&mut self, sample: Option<PowerSample>) -> bool {
        let info = match sample {
            None => PowerInfo::default(),
            Some(sample) => {
                let level = if sample.level.is_finite() {
                    sample.level.clamp(0.0, 1.0)
                } else {
                    1.0
                };
                let power_saving = if sample.charging {
                    false
                } else if self.info.power_saving {
                    level < self.config.recover_level
                } else {
                    level <= self.config.low_level
                };
                PowerInfo {
                    level: Some(level),
                    charging: Some(sample.charging),
                    power_saving,
                    sampled_at: Some(Utc::now()),
                }
            }
        };

        let toggled = info.power_saving != self.info.power_saving;
        if toggled {
            info!(
                power_saving = info.power_saving,
                level = ?info.level,
                charging = ?info.charging,
                "Power saving changed"
            );
        }
        self.info = info;
        self.tx.send_replace(self.info.clone());
        toggled
    }
}
