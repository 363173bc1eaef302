//! Playback preference store contract
//!
//! Preferences live outside the core. Controllers read them when a session is
//! attached and write them back when the user changes a setting; the values
//! are applied as-is.

use crate::types::QualitySelection;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// User playback preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackPreferences {
    pub volume: f64,
    pub muted: bool,
    pub playback_rate: f64,
    pub quality: QualitySelection,
}

impl Default for PlaybackPreferences {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            playback_rate: 1.0,
            quality: QualitySelection::Auto,
        }
    }
}

/// Narrow get/set contract to the client-side preference storage
pub trait PreferenceStore: Send + Sync {
    fn get(&self) -> PlaybackPreferences;
    fn set(&self, preferences: PlaybackPreferences);
}

/// In-process preference store
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    inner: RwLock<PlaybackPreferences>,
}

impl MemoryPreferenceStore {
    pub fn new(initial: PlaybackPreferences) -> Self {
        Self {
            inner: RwLock::new(initial),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self) -> PlaybackPreferences {
        self.inner.read().clone()
    }

    fn set(&self, preferences: PlaybackPreferences) {
        *self.inner.write() = preferences;
    }
}
