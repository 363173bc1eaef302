//! Core types for Flick

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a video in the feed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VideoId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an engine slot inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Token issued every time a source is set on a render surface.
///
/// Surface events and engine task results carry the token they were issued
/// for; anything carrying an older token belongs to a torn-down source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceToken(pub u64);

static NEXT_SOURCE_TOKEN: AtomicU64 = AtomicU64::new(1);

impl SourceToken {
    /// Issue a fresh token, unique for the lifetime of the process
    pub fn issue() -> Self {
        Self(NEXT_SOURCE_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SourceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A video in the feed as handed over by the data layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoItem {
    pub id: VideoId,
    /// Manifest or progressive source URL
    pub url: Url,
    /// Duration advertised by the API, if any
    #[serde(default)]
    pub duration_hint: Option<f64>,
}

impl VideoItem {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: VideoId::new(id),
            url,
            duration_hint: None,
        }
    }
}

/// Player state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// No source attached
    Idle,
    /// Source attached, metadata not yet available
    Loading,
    /// Enough data to start playback
    Ready,
    /// Content is playing
    Playing,
    /// Playback paused
    Paused,
    /// Waiting for data
    Buffering,
    /// Buffering persisted past the stall timeout
    Stalled,
    /// Playback reached the end
    Ended,
    /// Fatal error occurred
    Error,
}

impl PlayerState {
    pub const ALL: [PlayerState; 9] = [
        PlayerState::Idle,
        PlayerState::Loading,
        PlayerState::Ready,
        PlayerState::Playing,
        PlayerState::Paused,
        PlayerState::Buffering,
        PlayerState::Stalled,
        PlayerState::Ended,
        PlayerState::Error,
    ];

    /// Check if transition to target state is valid
    pub fn can_transition_to(&self, target: PlayerState) -> bool {
        use PlayerState::*;
        matches!(
            (self, target),
            // Reset is always allowed
            (_, Idle) |
            // From Idle
            (Idle, Loading) |
            // From Loading
            (Loading, Ready) | (Loading, Buffering) | (Loading, Error) |
            // From Ready
            (Ready, Playing) | (Ready, Paused) | (Ready, Buffering) | (Ready, Error) |
            // From Playing
            (Playing, Paused) | (Playing, Buffering) | (Playing, Ended) | (Playing, Error) |
            // From Paused
            (Paused, Playing) | (Paused, Buffering) | (Paused, Ended) | (Paused, Error) |
            // From Buffering
            (Buffering, Ready) | (Buffering, Playing) | (Buffering, Paused) | (Buffering, Stalled) | (Buffering, Error) |
            // From Stalled
            (Stalled, Ready) | (Stalled, Playing) | (Stalled, Paused) | (Stalled, Loading) | (Stalled, Error) |
            // From Ended
            (Ended, Playing) | (Ended, Buffering) | (Ended, Loading) |
            // From Error
            (Error, Loading)
        )
    }

    /// Whether the media pipeline holds a source in this state
    pub fn has_source(&self) -> bool {
        !matches!(self, PlayerState::Idle | PlayerState::Error)
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "idle"),
            PlayerState::Loading => write!(f, "loading"),
            PlayerState::Ready => write!(f, "ready"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::Buffering => write!(f, "buffering"),
            PlayerState::Stalled => write!(f, "stalled"),
            PlayerState::Ended => write!(f, "ended"),
            PlayerState::Error => write!(f, "error"),
        }
    }
}

/// One rung of the adaptive bitrate ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLevel {
    /// Human-readable label, e.g. "720p"
    pub label: String,
    /// Frame height in pixels (0 if unknown)
    pub height: u32,
    /// Advertised bitrate in bits per second
    pub bitrate_bps: u64,
}

impl QualityLevel {
    pub fn new(height: u32, bitrate_bps: u64) -> Self {
        Self {
            label: Self::label_for(height, bitrate_bps),
            height,
            bitrate_bps,
        }
    }

    /// Label derived from the height, falling back to bitrate
    pub fn label_for(height: u32, bitrate_bps: u64) -> String {
        if height > 0 {
            format!("{}p", height)
        } else {
            format!("{}kbps", bitrate_bps / 1000)
        }
    }
}

/// Requested quality: fixed ladder index or adaptive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySelection {
    #[default]
    Auto,
    Level(usize),
}

impl QualitySelection {
    pub fn is_auto(&self) -> bool {
        matches!(self, QualitySelection::Auto)
    }
}

/// How much of a video is prepared ahead of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Headers, manifest and first frame metadata
    Metadata,
    /// A bounded leading chunk of the stream
    Partial,
    /// Buffer as far as the engine allows
    Full,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceClass::Metadata => write!(f, "metadata"),
            ResourceClass::Partial => write!(f, "partial"),
            ResourceClass::Full => write!(f, "full"),
        }
    }
}

/// Lifecycle of a preload task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadStatus {
    Pending,
    Loading,
    Loaded,
    Error,
}

/// State of a pooled engine slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Preparing,
    Ready,
    Active,
    Paused,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Empty => write!(f, "empty"),
            SlotState::Preparing => write!(f, "preparing"),
            SlotState::Ready => write!(f, "ready"),
            SlotState::Active => write!(f, "active"),
            SlotState::Paused => write!(f, "paused"),
        }
    }
}

/// A buffered time range in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Connectivity class derived from platform probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    Offline,
    Slow,
    Fast,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionClass::Offline => write!(f, "offline"),
            ConnectionClass::Slow => write!(f, "slow"),
            ConnectionClass::Fast => write!(f, "fast"),
            ConnectionClass::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_reachable_from_every_state() {
        for state in PlayerState::ALL {
            assert!(state.can_transition_to(PlayerState::Idle), "{state} -> idle");
        }
    }

    #[test]
    fn test_error_only_retries_through_loading() {
        for target in PlayerState::ALL {
            let expected = matches!(target, PlayerState::Idle | PlayerState::Loading);
            assert_eq!(PlayerState::Error.can_transition_to(target), expected, "error -> {target}");
        }
    }

    #[test]
    fn test_source_tokens_are_unique() {
        let a = SourceToken::issue();
        let b = SourceToken::issue();
        assert!(b > a);
    }

    #[test]
    fn test_quality_labels() {
        assert_eq!(QualityLevel::new(720, 2_800_000).label, "720p");
        assert_eq!(QualityLevel::new(0, 640_000).label, "640kbps");
    }

    #[test]
    fn test_resource_class_ordering() {
        assert!(ResourceClass::Metadata < ResourceClass::Partial);
        assert!(ResourceClass::Partial < ResourceClass::Full);
    }
}
