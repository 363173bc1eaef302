//! Render surface boundary
//!
//! A [`MediaSurface`] is the element that actually decodes and displays a
//! stream. The platform layer implements it; the core only issues commands
//! and consumes the [`MediaEvent`]s the surface reports back through the
//! channel it was created with.

use crate::error::StreamErrorKind;
use crate::types::{SlotId, SourceToken, TimeRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Why the platform refused to start playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayRejection {
    /// Autoplay policy requires a user gesture (or muted playback)
    AutoplayBlocked,
    /// Any other rejection
    Failed(String),
}

/// How eagerly the surface should fetch its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadMode {
    None,
    Metadata,
    Auto,
}

/// Commands understood by a render surface
#[async_trait]
pub trait MediaSurface: Send {
    /// Attach a source; every later event for it carries `token`
    fn set_source(&mut self, url: &Url, token: SourceToken);

    /// Detach the source and drop any buffered data and pending requests
    fn clear_source(&mut self);

    /// Reload the current source, keeping what is already buffered
    fn restart_load(&mut self, position: f64);

    /// Reset the decoder after a media failure
    fn recover_decoder(&mut self);

    async fn play(&mut self) -> std::result::Result<(), PlayRejection>;

    fn pause(&mut self);

    fn seek(&mut self, position: f64);

    fn set_volume(&mut self, volume: f64);

    fn set_muted(&mut self, muted: bool);

    fn set_playback_rate(&mut self, rate: f64);

    /// Pin a variant of the current stream, `None` for adaptive
    fn select_variant(&mut self, level: Option<usize>);

    fn set_preload(&mut self, mode: PreloadMode);

    /// Hint for how many seconds to buffer ahead
    fn set_buffer_ahead(&mut self, seconds: f64);
}

/// Failure reported by the media pipeline before classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFailure {
    pub kind: StreamErrorKind,
    /// Whether the pipeline itself gave up on the source
    pub fatal: bool,
    pub details: String,
}

impl MediaFailure {
    pub fn network(details: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Network,
            fatal: true,
            details: details.into(),
        }
    }

    pub fn decode(details: impl Into<String>) -> Self {
        Self {
            kind: StreamErrorKind::Media,
            fatal: true,
            details: details.into(),
        }
    }
}

/// Media element event kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaEventKind {
    LoadStart,
    LoadedMetadata { duration: Option<f64> },
    CanPlay,
    Playing,
    Paused,
    Waiting,
    TimeUpdate { position: f64 },
    Progress { buffered: Vec<TimeRange> },
    /// The adaptive pipeline switched to another variant
    VariantSwitched { level: usize },
    Ended,
    Error(MediaFailure),
    /// Timing of a completed transfer
    Transfer { bytes: u64, elapsed: Duration },
}

/// An event tagged with the source it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEvent {
    pub token: SourceToken,
    pub kind: MediaEventKind,
}

impl MediaEvent {
    pub fn new(token: SourceToken, kind: MediaEventKind) -> Self {
        Self { token, kind }
    }
}

/// A media event routed to the slot owning the surface
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceEvent {
    pub slot: SlotId,
    pub event: MediaEvent,
}

/// What the platform media stack can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    /// Media Source Extensions (or an equivalent) for manifest-driven playback
    pub media_source_extensions: bool,
    /// The platform plays adaptive manifests itself
    pub native_hls: bool,
}

/// Creates the render surfaces backing pool slots
pub trait SurfaceFactory: Send + Sync {
    fn capabilities(&self) -> PlatformCapabilities;

    /// Create the surface for `slot`, reporting its events on `events`
    fn create(
        &self,
        slot: SlotId,
        events: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Box<dyn MediaSurface>;
}
