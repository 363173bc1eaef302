//! Feed events and commands
//!
//! [`FeedEvent`]s flow out of the core to the UI layer. [`Intent`]s are the
//! high-level requests of the gesture layer, and [`FeedCommand`]s are what a
//! [`FeedRuntime`](crate::runtime::FeedRuntime) accepts.

use crate::analytics::AnalyticsSnapshot;
use crate::error::StreamError;
use crate::feed::FeedStats;
use crate::network::NetworkSample;
use crate::policy::Inhibitor;
use crate::power::PowerSample;
use crate::types::*;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Outcome of a play request; never an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PlayOutcome {
    /// Playback started, possibly after retrying muted
    Started { muted_fallback: bool },
    /// Autoplay is blocked even when muted; the UI should ask for a tap
    GestureRequired,
    /// Held back until the source is ready or inhibitors clear
    Deferred,
    /// Playback failed for another reason
    Failed { reason: String },
    /// Nothing attached to play
    NoSession,
}

impl PlayOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, PlayOutcome::Started { .. })
    }
}

/// Events published to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    StateChanged {
        slot: SlotId,
        video_id: VideoId,
        state: PlayerState,
        previous: PlayerState,
    },
    QualityLevels {
        slot: SlotId,
        video_id: VideoId,
        levels: Vec<QualityLevel>,
    },
    QualityChanged {
        slot: SlotId,
        video_id: VideoId,
        level: Option<usize>,
        auto: bool,
    },
    /// The engine gave up; surfaced once per failure
    Fatal {
        slot: SlotId,
        video_id: VideoId,
        error: StreamError,
    },
    GestureRequired {
        slot: SlotId,
        video_id: VideoId,
    },
    AutoPaused {
        slot: SlotId,
        inhibitor: Inhibitor,
    },
    AutoResumed {
        slot: SlotId,
    },
    SessionEnded {
        slot: SlotId,
        analytics: AnalyticsSnapshot,
    },
}

/// High-level gesture layer requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    TogglePlay,
    Play,
    Pause,
    Seek { position: f64 },
    Next,
    Prev,
    Retry,
    SetVolume { volume: f64 },
    ToggleMute,
    SetQuality { selection: QualitySelection },
    SetRate { rate: f64 },
}

/// Commands accepted by the feed runtime
#[derive(Debug)]
pub enum FeedCommand {
    IndexChanged {
        index: usize,
        videos: Vec<VideoItem>,
    },
    Intent(Intent),
    ScrollVelocity(f64),
    NetworkSample(Option<NetworkSample>),
    PowerSample(Option<PowerSample>),
    Stats(oneshot::Sender<FeedStats>),
    Shutdown,
}
