//! Stream error recovery policy
//!
//! Network failures are retried with backoff up to a fixed bound; decode
//! failures get a bounded number of decoder recovery cycles; unsupported
//! sources fail immediately. Counters reset once playback resumes.

use crate::config::RecoveryConfig;
use crate::error::StreamErrorKind;
use std::time::Duration;
use tracing::debug;

/// What a scheduled retry reloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTarget {
    /// Restart the surface load at the current position
    Source,
    /// Fetch the manifest again
    Manifest,
}

/// Decision for one reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Pipeline recovers on its own
    Ignore,
    Retry {
        attempt: u32,
        delay: Duration,
        target: RetryTarget,
    },
    RecoverDecoder {
        attempt: u32,
    },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    config: RecoveryConfig,
    network_failures: u32,
    decode_recoveries: u32,
}

impl RecoveryPolicy {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            network_failures: 0,
            decode_recoveries: 0,
        }
    }

    pub fn network_failures(&self) -> u32 {
        self.network_failures
    }

    pub fn decode_recoveries(&self) -> u32 {
        self.decode_recoveries
    }

    /// Classify a failure and advance the matching counter
    pub fn on_failure(&mut self, kind: StreamErrorKind, fatal: bool, target: RetryTarget) -> RecoveryAction {
        if !fatal {
            return RecoveryAction::Ignore;
        }
        match kind {
            StreamErrorKind::Network => {
                if self.network_failures >= self.config.max_network_retries {
                    return RecoveryAction::GiveUp;
                }
                self.network_failures += 1;
                RecoveryAction::Retry {
                    attempt: self.network_failures,
                    delay: self.config.retry_delay(self.network_failures),
                    target,
                }
            }
            StreamErrorKind::Media => {
                if self.decode_recoveries >= self.config.max_decode_recoveries {
                    return RecoveryAction::GiveUp;
                }
                self.decode_recoveries += 1;
                RecoveryAction::RecoverDecoder {
                    attempt: self.decode_recoveries,
                }
            }
            StreamErrorKind::Unsupported | StreamErrorKind::Other => RecoveryAction::GiveUp,
        }
    }

    /// Playback made progress; forget earlier failures
    pub fn on_playing(&mut self) {
        if self.network_failures > 0 || self.decode_recoveries > 0 {
            debug!(
                network_failures = self.network_failures,
                decode_recoveries = self.decode_recoveries,
                "Recovery counters reset"
            );
        }
        self.network_failures = 0;
        self.decode_recoveries = 0;
    }
}
