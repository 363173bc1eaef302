//! Network monitor
//!
//! Classifies connectivity from a platform probe into offline / slow / fast
//! and derives buffering recommendations. A missing probe or an empty sample
//! degrades to `Unknown`, for which every recommendation is neutral.

use crate::config::NetworkConfig;
use crate::types::ConnectionClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Effective connection type reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

/// Raw reading from the platform connectivity probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub online: bool,
    #[serde(default)]
    pub effective_type: Option<EffectiveType>,
    #[serde(default)]
    pub downlink_mbps: Option<f64>,
    #[serde(default)]
    pub rtt_ms: Option<u32>,
    #[serde(default)]
    pub save_data: bool,
}

impl NetworkSample {
    pub fn offline() -> Self {
        Self {
            online: false,
            effective_type: None,
            downlink_mbps: None,
            rtt_ms: None,
            save_data: false,
        }
    }

    pub fn with_downlink(downlink_mbps: f64) -> Self {
        Self {
            online: true,
            effective_type: None,
            downlink_mbps: Some(downlink_mbps),
            rtt_ms: None,
            save_data: false,
        }
    }
}

/// Platform connectivity probe
pub trait NetworkProbe: Send {
    /// Current reading, `None` if the platform exposes nothing
    fn sample(&mut self) -> Option<NetworkSample>;
}

/// Point-in-time connectivity snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub class: ConnectionClass,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u32>,
    pub save_data: bool,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            class: ConnectionClass::Unknown,
            downlink_mbps: None,
            rtt_ms: None,
            save_data: false,
            sampled_at: None,
        }
    }
}

/// Buffering parameters recommended for the current connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferRecommendation {
    /// Seconds the engine should buffer ahead of the cursor
    pub buffer_ahead_secs: f64,
    /// Feed positions ahead worth preloading
    pub preload_ahead: usize,
    /// Pin the lowest quality level
    pub force_low_quality: bool,
    /// Stop dequeuing preload tasks
    pub pause_preloading: bool,
}

impl BufferRecommendation {
    pub fn for_class(class: ConnectionClass) -> Self {
        match class {
            ConnectionClass::Offline => Self {
                buffer_ahead_secs: 0.0,
                preload_ahead: 0,
                force_low_quality: false,
                pause_preloading: true,
            },
            ConnectionClass::Slow => Self {
                buffer_ahead_secs: 6.0,
                preload_ahead: 1,
                force_low_quality: true,
                pause_preloading: false,
            },
            ConnectionClass::Fast => Self {
                buffer_ahead_secs: 20.0,
                preload_ahead: 3,
                force_low_quality: false,
                pause_preloading: false,
            },
            ConnectionClass::Unknown => Self {
                buffer_ahead_secs: 10.0,
                preload_ahead: 2,
                force_low_quality: false,
                pause_preloading: false,
            },
        }
    }
}

/// Observes connectivity with hysteresis between slow and fast
pub struct NetworkMonitor {
    config: NetworkConfig,
    probe: Option<Box<dyn NetworkProbe>>,
    info: NetworkInfo,
    /// Candidate class and how many consecutive samples agreed on it
    pending: Option<(ConnectionClass, u32)>,
    tx: watch::Sender<NetworkInfo>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig, probe: Option<Box<dyn NetworkProbe>>) -> Self {
        let (tx, _) = watch::channel(NetworkInfo::default());
        Self {
            config,
            probe,
            info: NetworkInfo::default(),
            pending: None,
            tx,
        }
    }

    pub fn info(&self) -> &NetworkInfo {
        &self.info
    }

    pub fn class(&self) -> ConnectionClass {
        self.info.class
    }

    pub fn recommendation(&self) -> BufferRecommendation {
        BufferRecommendation::for_class(self.info.class)
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkInfo> {
        self.tx.subscribe()
    }

    /// Read the probe and apply the sample; true if the class changed
    pub fn refresh(&mut self) -> bool {
        let sample = self.probe.as_mut().and_then(|probe| probe.sample());
        self.update(sample)
    }

    /// Apply a sample; true if the class changed
    pub fn update(&mut self, sample: Option<NetworkSample>) -> bool {
        let Some(sample) = sample else {
            return self.commit(NetworkInfo::default());
        };

        let observed = self.classify(&sample);
        let info = NetworkInfo {
            class: self.info.class,
            downlink_mbps: sample.downlink_mbps,
            rtt_ms: sample.rtt_ms,
            save_data: sample.save_data,
            sampled_at: Some(Utc::now()),
        };

        let immediate = matches!(observed, ConnectionClass::Offline)
            || matches!(self.info.class, ConnectionClass::Offline | ConnectionClass::Unknown);

        let class = if observed == self.info.class {
            self.pending = None;
            observed
        } else if immediate {
            self.pending = None;
            observed
        } else {
            let seen = match self.pending {
                Some((candidate, count)) if candidate == observed => count + 1,
                _ => 1,
            };
            if seen >= self.config.hysteresis_samples.max(1) {
                self.pending = None;
                observed
            } else {
                debug!(candidate = %observed, seen, "Holding connection class");
                self.pending = Some((observed, seen));
                self.info.class
            }
        };

        self.commit(NetworkInfo { class, ..info })
    }

    fn classify(&self, sample: &NetworkSample) -> ConnectionClass {
        if !sample.online {
            return ConnectionClass::Offline;
        }
        if sample.save_data {
            return ConnectionClass::Slow;
        }
        if matches!(
            sample.effective_type,
            Some(EffectiveType::Slow2g | EffectiveType::TwoG)
        ) {
            return ConnectionClass::Slow;
        }
        if let Some(downlink) = sample.downlink_mbps {
            if downlink < self.config.slow_downlink_mbps {
                return ConnectionClass::Slow;
            }
        }
        if let Some(rtt) = sample.rtt_ms {
            if rtt > self.config.slow_rtt_ms {
                return ConnectionClass::Slow;
            }
        }
        ConnectionClass::Fast
    }

    fn commit(&mut self, info: NetworkInfo) -> bool {
        let changed = info.class != self.info.class;
        if changed {
            info!(from = %self.info.class, to = %info.class, "Connection class changed");
        }
        self.info = info;
        self.tx.send_replace(self.info.clone());
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProbe(Vec<Option<NetworkSample>>);

    impl NetworkProbe for ScriptedProbe {
        fn sample(&mut self) -> Option<NetworkSample> {
            if self.0.is_empty() {
                None
            } else {
                self.0.remove(0)
            }
        }
    }

    #[test]
    fn test_no_probe_is_unknown_and_neutral() {
        let mut monitor = NetworkMonitor::new(NetworkConfig::default(), None);
        assert!(!monitor.refresh());
        assert_eq!(monitor.class(), ConnectionClass::Unknown);

        let rec = monitor.recommendation();
        assert!(!rec.force_low_quality);
        assert!(!rec.pause_preloading);
    }

    #[test]
    fn test_first_sample_applies_immediately() {
        let probe = ScriptedProbe(vec![Some(NetworkSample::with_downlink(0.4))]);
        let mut monitor = NetworkMonitor::new(NetworkConfig::default(), Some(Box::new(probe)));
        assert!(monitor.refresh());
        assert_eq!(monitor.class(), ConnectionClass::Slow);
        assert!(monitor.recommendation().force_low_quality);
    }

    #[test]
    fn test_hysteresis_between_slow_and_fast() {
        let mut monitor = NetworkMonitor::new(NetworkConfig::default(), None);
        monitor.update(Some(NetworkSample::with_downlink(10.0)));
        assert_eq!(monitor.class(), ConnectionClass::Fast);

        assert!(!monitor.update(Some(NetworkSample::with_downlink(0.5))));
        assert_eq!(monitor.class(), ConnectionClass::Fast);

        assert!(monitor.update(Some(NetworkSample::with_downlink(0.5))));
        assert_eq!(monitor.class(), ConnectionClass::Slow);
    }

    #[test]
    fn test_offline_is_immediate() {
        let mut monitor = NetworkMonitor::new(NetworkConfig::default(), None);
        monitor.update(Some(NetworkSample::with_downlink(10.0)));
        let rx = monitor.subscribe();

        assert!(monitor.update(Some(NetworkSample::offline())));
        assert_eq!(rx.borrow().class, ConnectionClass::Offline);
        assert!(monitor.recommendation().pause_preloading);

        assert!(monitor.update(Some(NetworkSample::with_downlink(10.0))));
        assert_eq!(monitor.class(), ConnectionClass::Fast);
    }

    #[test]
    fn test_effective_type_json() {
        let sample: NetworkSample =
            serde_json::from_str(r#"{ "online": true, "effective_type": "slow-2g" }"#).unwrap();
        assert_eq!(sample.effective_type, Some(EffectiveType::Slow2g));
    }
}
