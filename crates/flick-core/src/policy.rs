//! Auto-pause arbitration
//!
//! Offline and low-battery policies share one inhibitor set per controller.
//! Whether playback was active is remembered when the first inhibitor
//! engages, and playback resumes only once every inhibitor has cleared.
//! A manual play or pause forgets the remembered state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// A condition that holds playback paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Inhibitor {
    Offline,
    LowBattery,
}

impl std::fmt::Display for Inhibitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inhibitor::Offline => write!(f, "offline"),
            Inhibitor::LowBattery => write!(f, "low_battery"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterDecision {
    Nothing,
    Pause,
    Resume,
}

#[derive(Debug, Default, Clone)]
pub struct AutoPauseArbiter {
    active: BTreeSet<Inhibitor>,
    resume_on_clear: bool,
}

impl AutoPauseArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_inhibited(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn inhibitors(&self) -> Vec<Inhibitor> {
        self.active.iter().copied().collect()
    }

    pub fn will_resume(&self) -> bool {
        self.resume_on_clear
    }

    /// An inhibitor became active
    pub fn engage(&mut self, inhibitor: Inhibitor, playing: bool) -> ArbiterDecision {
        if !self.active.insert(inhibitor) {
            return ArbiterDecision::Nothing;
        }
        debug!(%inhibitor, playing, "Inhibitor engaged");
        if self.active.len() == 1 {
            self.resume_on_clear = playing;
        } else if playing {
            // Playback was started by hand while already inhibited
            self.resume_on_clear = true;
        }
        if playing {
            ArbiterDecision::Pause
        } else {
            ArbiterDecision::Nothing
        }
    }

    /// An inhibitor cleared
    pub fn release(&mut self, inhibitor: Inhibitor) -> ArbiterDecision {
        if !self.active.remove(&inhibitor) {
            return ArbiterDecision::Nothing;
        }
        debug!(%inhibitor, remaining = self.active.len(), "Inhibitor released");
        if self.active.is_empty() && std::mem::take(&mut self.resume_on_clear) {
            ArbiterDecision::Resume
        } else {
            ArbiterDecision::Nothing
        }
    }

    /// Playback was requested while inhibited; start it once clear
    pub fn defer_playback(&mut self) {
        if self.is_inhibited() {
            self.resume_on_clear = true;
        }
    }

    /// The user took over transport control
    pub fn forget(&mut self) {
        self.resume_on_clear = false;
    }
}
