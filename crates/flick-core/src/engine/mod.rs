//! Stream engines
//!
//! A [`StreamEngine`] owns one render surface while a source is attached and
//! turns the surface's raw events into engine-agnostic [`EngineEvent`]s.
//! Two variants exist:
//!
//! - [`ManifestEngine`]: resolves the quality ladder itself and supports
//!   pinning a level
//! - [`NativeEngine`]: leaves adaptation to the platform; quality is always
//!   auto
//!
//! The variant is picked once per attach from [`PlatformCapabilities`]. Both
//! run the same recovery policy and signal translation, so the state
//! sequence a controller observes does not depend on the variant.

pub mod bandwidth;
pub mod loader;
pub mod manifest;
pub mod native;
mod pipeline;
pub mod recovery;
pub mod surface;

pub use bandwidth::{EwmaEstimator, TransferSample, WindowEstimator};
#[cfg(feature = "hls")]
pub use loader::HlsManifestLoader;
pub use loader::ManifestLoader;
pub use manifest::ManifestEngine;
pub use native::NativeEngine;
pub use recovery::{RecoveryAction, RecoveryPolicy, RetryTarget};
pub use surface::{
    MediaEvent, MediaEventKind, MediaFailure, MediaSurface, PlatformCapabilities, PlayRejection,
    PreloadMode, SurfaceEvent, SurfaceFactory,
};

use crate::config::RecoveryConfig;
use crate::error::StreamError;
use crate::types::{QualityLevel, QualitySelection, SlotId, SourceToken, TimeRange};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

/// Engine variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Manifest,
    Native,
}

impl EngineKind {
    /// Pick the variant for a platform
    pub fn select(capabilities: &PlatformCapabilities, has_loader: bool) -> Self {
        if capabilities.media_source_extensions && has_loader {
            EngineKind::Manifest
        } else {
            EngineKind::Native
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Manifest => write!(f, "manifest"),
            EngineKind::Native => write!(f, "native"),
        }
    }
}

/// What an engine needs besides its surface
#[derive(Clone)]
pub struct EngineContext {
    pub slot: SlotId,
    pub loader: Option<Arc<dyn ManifestLoader>>,
    /// Where background engine work reports back
    pub tasks: mpsc::UnboundedSender<EngineTaskResult>,
    pub recovery: RecoveryConfig,
}

/// Result of background engine work, tagged with the source it ran for
#[derive(Debug)]
pub struct EngineTaskResult {
    pub slot: SlotId,
    pub token: SourceToken,
    pub levels: Result<Vec<QualityLevel>>,
}

/// Transport signals, identical for both variants
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSignal {
    Loading,
    MetadataLoaded { duration: Option<f64> },
    Ready,
    Playing,
    Paused,
    Buffering,
    Ended,
    Position(f64),
    Buffered(Vec<TimeRange>),
}

/// Everything an engine reports to its controller
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Playback(PlaybackSignal),
    LevelsDiscovered(Vec<QualityLevel>),
    QualityChanged { level: Option<usize>, auto: bool },
    /// Bandwidth estimate in bits per second
    Bandwidth(u64),
    Error(StreamError),
}

/// One of the two engine variants, bound to a surface and a source
pub enum StreamEngine {
    Manifest(ManifestEngine),
    Native(NativeEngine),
}

impl StreamEngine {
    /// Take `surface` and attach `url` to it
    pub fn attach(
        kind: EngineKind,
        surface: Box<dyn MediaSurface>,
        url: &Url,
        ctx: EngineContext,
    ) -> Self {
        info!(slot = %ctx.slot, engine = %kind, url = %url, "Attaching stream engine");
        match kind {
            EngineKind::Manifest => StreamEngine::Manifest(ManifestEngine::attach(surface, url, ctx)),
            EngineKind::Native => StreamEngine::Native(NativeEngine::attach(surface, url, ctx)),
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            StreamEngine::Manifest(_) => EngineKind::Manifest,
            StreamEngine::Native(_) => EngineKind::Native,
        }
    }

    /// Token of the attached source
    pub fn token(&self) -> SourceToken {
        match self {
            StreamEngine::Manifest(e) => e.pipeline().token(),
            StreamEngine::Native(e) => e.pipeline().token(),
        }
    }

    pub fn url(&self) -> &Url {
        match self {
            StreamEngine::Manifest(e) => e.pipeline().url(),
            StreamEngine::Native(e) => e.pipeline().url(),
        }
    }

    pub fn is_failed(&self) -> bool {
        match self {
            StreamEngine::Manifest(e) => e.pipeline().is_failed(),
            StreamEngine::Native(e) => e.pipeline().is_failed(),
        }
    }

    pub async fn play(&mut self) -> std::result::Result<(), PlayRejection> {
        self.surface_mut().play().await
    }

    pub fn set_quality(&mut self, selection: QualitySelection) -> Result<()> {
        match self {
            StreamEngine::Manifest(e) => e.set_quality(selection),
            StreamEngine::Native(e) => e.set_quality(selection),
        }
    }

    pub fn levels(&self) -> &[QualityLevel] {
        match self {
            StreamEngine::Manifest(e) => e.levels(),
            StreamEngine::Native(_) => &[],
        }
    }

    pub fn is_auto(&self) -> bool {
        match self {
            StreamEngine::Manifest(e) => e.selection().is_auto(),
            StreamEngine::Native(_) => true,
        }
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        match self {
            StreamEngine::Manifest(e) => e.bandwidth_estimate(),
            StreamEngine::Native(e) => e.bandwidth_estimate(),
        }
    }

    pub fn surface_mut(&mut self) -> &mut dyn MediaSurface {
        match self {
            StreamEngine::Manifest(e) => e.pipeline_mut().surface_mut(),
            StreamEngine::Native(e) => e.pipeline_mut().surface_mut(),
        }
    }

    /// Handle a surface event; events for another source are dropped
    pub fn handle_media_event(&mut self, event: MediaEvent) -> Vec<EngineEvent> {
        if event.token != self.token() {
            debug!(token = %event.token, current = %self.token(), "Dropping stale media event");
            return Vec::new();
        }
        if self.is_failed() {
            return Vec::new();
        }
        match self {
            StreamEngine::Manifest(e) => e.handle_media_event(event.kind),
            StreamEngine::Native(e) => e.handle_media_event(event.kind),
        }
    }

    /// Handle background work; results for another source are dropped
    pub fn handle_task(&mut self, result: EngineTaskResult) -> Vec<EngineEvent> {
        if result.token != self.token() || self.is_failed() {
            debug!(token = %result.token, "Dropping stale engine task result");
            return Vec::new();
        }
        match self {
            StreamEngine::Manifest(e) => e.handle_task(result),
            StreamEngine::Native(_) => Vec::new(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            StreamEngine::Manifest(e) => e.pipeline().next_deadline(),
            StreamEngine::Native(e) => e.pipeline().next_deadline(),
        }
    }

    /// Fire due retries
    pub fn poll_timers(&mut self, now: Instant) {
        match self {
            StreamEngine::Manifest(e) => e.poll_timers(now),
            StreamEngine::Native(e) => e.poll_timers(now),
        }
    }

    /// Tear down: clear the source, abandon background work and hand the
    /// surface back for reuse
    pub fn destroy(self) -> Box<dyn MediaSurface> {
        match self {
            StreamEngine::Manifest(e) => {
                debug!(slot = %e.pipeline().slot(), "Destroying manifest engine");
                e.destroy()
            }
            StreamEngine::Native(e) => {
                debug!(slot = %e.pipeline().slot(), "Destroying native engine");
                e.destroy()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessOptions, HeadlessSurface, SurfaceCommand};
    use crate::Error;
    use async_trait::async_trait;
    use std::time::Duration;

    struct LadderLoader(Vec<QualityLevel>);

    #[async_trait]
    impl ManifestLoader for LadderLoader {
        async fn load_levels(&self, _url: &Url) -> Result<Vec<QualityLevel>> {
            Ok(self.0.clone())
        }
    }

    struct Rig {
        engine: StreamEngine,
        handle: crate::headless::HeadlessHandle,
        tasks: mpsc::UnboundedReceiver<EngineTaskResult>,
    }

    fn rig(kind: EngineKind) -> Rig {
        let (surface_tx, _surface_rx) = mpsc::unbounded_channel();
        let (task_tx, tasks) = mpsc::unbounded_channel();
        let (surface, handle) =
            HeadlessSurface::new(SlotId(0), surface_tx, HeadlessOptions::default());
        let loader: Arc<dyn ManifestLoader> = Arc::new(LadderLoader(vec![
            QualityLevel::new(360, 800_000),
            QualityLevel::new(720, 2_800_000),
        ]));
        let ctx = EngineContext {
            slot: SlotId(0),
            loader: Some(loader),
            tasks: task_tx,
            recovery: RecoveryConfig::default(),
        };
        let url = Url::parse("https://cdn.example.com/v.m3u8").unwrap();
        Rig {
            engine: StreamEngine::attach(kind, Box::new(surface), &url, ctx),
            handle,
            tasks,
        }
    }

    fn event(engine: &StreamEngine, kind: MediaEventKind) -> MediaEvent {
        MediaEvent::new(engine.token(), kind)
    }

    fn network_failure(engine: &StreamEngine) -> MediaEvent {
        event(engine, MediaEventKind::Error(MediaFailure::network("segment 404")))
    }

    #[tokio::test]
    async fn test_three_network_failures_recover_fourth_is_fatal() {
        for kind in [EngineKind::Manifest, EngineKind::Native] {
            let mut rig = rig(kind);

            for _ in 0..3 {
                let ev = network_failure(&rig.engine);
                let events = rig.engine.handle_media_event(ev);
                assert_eq!(events.len(), 1);
                assert!(matches!(&events[0], EngineEvent::Error(e) if !e.is_fatal()));
                assert!(!rig.engine.is_failed());
            }

            let ev = network_failure(&rig.engine);
            let events = rig.engine.handle_media_event(ev);
            assert!(matches!(&events[..], [EngineEvent::Error(e)] if e.is_fatal()));
            assert!(rig.engine.is_failed());

            // Torn down: nothing else leaves the engine
            let ev = network_failure(&rig.engine);
            assert!(rig.engine.handle_media_event(ev).is_empty());
            assert!(rig.handle.commands().contains(&SurfaceCommand::ClearSource));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reloads_source_after_backoff() {
        let mut rig = rig(EngineKind::Native);
        let ev = network_failure(&rig.engine);
        rig.engine.handle_media_event(ev);

        let deadline = rig.engine.next_deadline().unwrap();
        rig.engine.poll_timers(Instant::now());
        assert!(!rig.handle.commands().iter().any(|c| matches!(c, SurfaceCommand::RestartLoad(_))));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(Instant::now() >= deadline);
        rig.engine.poll_timers(Instant::now());
        assert!(rig.handle.commands().iter().any(|c| matches!(c, SurfaceCommand::RestartLoad(_))));
        assert!(rig.engine.next_deadline().is_none());
    }

    #[tokio::test]
    async fn test_single_decode_recovery_then_fatal() {
        let mut rig = rig(EngineKind::Manifest);
        let decode = MediaEventKind::Error(MediaFailure::decode("bad frame"));

        let ev = event(&rig.engine, decode.clone());
        let events = rig.engine.handle_media_event(ev);
        assert!(matches!(&events[..], [EngineEvent::Error(e)] if !e.is_fatal()));
        assert!(rig.handle.commands().contains(&SurfaceCommand::RecoverDecoder));

        let ev = event(&rig.engine, decode);
        let events = rig.engine.handle_media_event(ev);
        assert!(matches!(&events[..], [EngineEvent::Error(e)] if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_variants_produce_same_signals() {
        let script = vec![
            MediaEventKind::LoadStart,
            MediaEventKind::LoadedMetadata { duration: Some(12.0) },
            MediaEventKind::CanPlay,
            MediaEventKind::Playing,
            MediaEventKind::Waiting,
            MediaEventKind::Playing,
            MediaEventKind::Ended,
        ];

        let mut sequences = Vec::new();
        for kind in [EngineKind::Manifest, EngineKind::Native] {
            let mut rig = rig(kind);
            let mut signals = Vec::new();
            for step in &script {
                let ev = event(&rig.engine, step.clone());
                signals.extend(rig.engine.handle_media_event(ev));
            }
            sequences.push(signals);
        }
        assert_eq!(sequences[0], sequences[1]);
    }

    #[tokio::test]
    async fn test_stale_token_is_dropped() {
        let rig = rig(EngineKind::Native);
        let old = rig.engine.token();

        // Reattach the same surface to another source, as slot reuse does
        let surface = rig.engine.destroy();
        let (task_tx, _tasks) = mpsc::unbounded_channel();
        let ctx = EngineContext {
            slot: SlotId(0),
            loader: None,
            tasks: task_tx,
            recovery: RecoveryConfig::default(),
        };
        let other = Url::parse("https://cdn.example.com/other.mp4").unwrap();
        let mut engine = StreamEngine::attach(EngineKind::Native, surface, &other, ctx);
        assert_ne!(engine.token(), old);
        assert_eq!(rig.handle.source().map(|(url, _)| url), Some(other));

        let stale = MediaEvent::new(old, MediaEventKind::Playing);
        assert!(engine.handle_media_event(stale).is_empty());
    }

    #[tokio::test]
    async fn test_manifest_engine_discovers_levels() {
        let mut rig = rig(EngineKind::Manifest);
        let result = rig.tasks.recv().await.unwrap();
        let events = rig.engine.handle_task(result);
        assert!(matches!(&events[..], [EngineEvent::LevelsDiscovered(levels)] if levels.len() == 2));

        rig.engine.set_quality(QualitySelection::Level(1)).unwrap();
        assert!(!rig.engine.is_auto());
        assert!(rig.handle.commands().contains(&SurfaceCommand::SelectVariant(Some(1))));

        let err = rig.engine.set_quality(QualitySelection::Level(5)).unwrap_err();
        assert!(matches!(err, Error::InvalidQuality { index: 5, available: 2 }));

        let ev = event(&rig.engine, MediaEventKind::VariantSwitched { level: 1 });
        let events = rig.engine.handle_media_event(ev);
        assert_eq!(events, vec![EngineEvent::QualityChanged { level: Some(1), auto: false }]);
    }

    #[tokio::test]
    async fn test_native_engine_is_always_auto() {
        let mut rig = rig(EngineKind::Native);
        assert!(rig.engine.is_auto());
        assert!(rig.engine.levels().is_empty());
        assert!(rig.engine.set_quality(QualitySelection::Level(0)).is_err());
        assert!(rig.engine.set_quality(QualitySelection::Auto).is_ok());

        for _ in 0..12 {
            let ev = event(
                &rig.engine,
                MediaEventKind::Transfer { bytes: 250_000, elapsed: Duration::from_secs(1) },
            );
            rig.engine.handle_media_event(ev);
        }
        assert_eq!(rig.engine.bandwidth_estimate(), 2_000_000);
    }

    #[tokio::test]
    async fn test_destroy_returns_surface_without_source() {
        let rig = rig(EngineKind::Manifest);
        let handle = rig.handle.clone();
        let _surface = rig.engine.destroy();
        assert_eq!(handle.commands().last(), Some(&SurfaceCommand::ClearSource));
        assert!(handle.source().is_none());
    }

    #[test]
    fn test_kind_selection() {
        let mse = PlatformCapabilities { media_source_extensions: true, native_hls: false };
        let native = PlatformCapabilities { media_source_extensions: false, native_hls: true };
        assert_eq!(EngineKind::select(&mse, true), EngineKind::Manifest);
        assert_eq!(EngineKind::select(&mse, false), EngineKind::Native);
        assert_eq!(EngineKind::select(&native, true), EngineKind::Native);
    }
}
