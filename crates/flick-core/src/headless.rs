//! Headless render surfaces
//!
//! A surface backend with no decoder behind it. Every command is recorded,
//! and in echo mode the surface answers with the events a media element
//! would emit, so a feed can run end to end in simulations and tests.

use crate::engine::surface::{
    MediaEvent, MediaEventKind, MediaSurface, PlatformCapabilities, PlayRejection, PreloadMode,
    SurfaceEvent, SurfaceFactory,
};
use crate::types::{SlotId, SourceToken, TimeRange};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Autoplay rule enforced by a headless surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoplayPolicy {
    #[default]
    Allowed,
    /// Only muted playback may start without a gesture
    MutedOnly,
    Blocked,
}

/// A command received by a headless surface
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceCommand {
    SetSource(Url),
    ClearSource,
    RestartLoad(f64),
    RecoverDecoder,
    Play,
    Pause,
    Seek(f64),
    SetVolume(f64),
    SetMuted(bool),
    SetPlaybackRate(f64),
    SelectVariant(Option<usize>),
    SetPreload(PreloadMode),
    SetBufferAhead(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessOptions {
    pub autoplay: AutoplayPolicy,
    /// Answer commands with the events a media element would emit
    pub echo: bool,
    /// Duration reported in `loadedmetadata`
    pub duration: f64,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            autoplay: AutoplayPolicy::Allowed,
            echo: false,
            duration: 15.0,
        }
    }
}

#[derive(Debug, Default)]
struct HeadlessState {
    source: Option<(Url, SourceToken)>,
    commands: Vec<SurfaceCommand>,
    muted: bool,
    playing: bool,
    position: f64,
}

/// Inspection and event injection for one headless surface
#[derive(Clone)]
pub struct HeadlessHandle {
    slot: SlotId,
    state: Arc<Mutex<HeadlessState>>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
}

impl HeadlessHandle {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn commands(&self) -> Vec<SurfaceCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    pub fn source(&self) -> Option<(Url, SourceToken)> {
        self.state.lock().source.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Emit an event for the current source; false without a source
    pub fn emit(&self, kind: MediaEventKind) -> bool {
        let token = match &self.state.lock().source {
            Some((_, token)) => *token,
            None => return false,
        };
        self.emit_with(token, kind);
        true
    }

    /// Emit an event tagged with an arbitrary token
    pub fn emit_with(&self, token: SourceToken, kind: MediaEventKind) {
        let _ = self.events.send(SurfaceEvent {
            slot: self.slot,
            event: MediaEvent::new(token, kind),
        });
    }
}

/// Surface with no decoder behind it
pub struct HeadlessSurface {
    handle: HeadlessHandle,
    options: HeadlessOptions,
}

impl HeadlessSurface {
    pub fn new(
        slot: SlotId,
        events: mpsc::UnboundedSender<SurfaceEvent>,
        options: HeadlessOptions,
    ) -> (Self, HeadlessHandle) {
        let handle = HeadlessHandle {
            slot,
            state: Arc::new(Mutex::new(HeadlessState::default())),
            events,
        };
        (
            Self {
                handle: handle.clone(),
                options,
            },
            handle,
        )
    }

    fn record(&self, command: SurfaceCommand) {
        self.handle.state.lock().commands.push(command);
    }

    fn echo(&self, kind: MediaEventKind) {
        if self.options.echo {
            self.handle.emit(kind);
        }
    }

    fn echo_load(&self) {
        let position = self.handle.state.lock().position;
        self.echo(MediaEventKind::LoadStart);
        self.echo(MediaEventKind::LoadedMetadata {
            duration: Some(self.options.duration),
        });
        self.echo(MediaEventKind::Progress {
            buffered: vec![TimeRange::new(position, (position + 5.0).min(self.options.duration))],
        });
        self.echo(MediaEventKind::CanPlay);
    }
}

#[async_trait]
impl MediaSurface for HeadlessSurface {
    fn set_source(&mut self, url: &Url, token: SourceToken) {
        self.record(SurfaceCommand::SetSource(url.clone()));
        {
            let mut state = self.handle.state.lock();
            state.source = Some((url.clone(), token));
            state.playing = false;
            state.position = 0.0;
        }
        self.echo_load();
    }

    fn clear_source(&mut self) {
        self.record(SurfaceCommand::ClearSource);
        let mut state = self.handle.state.lock();
        state.source = None;
        state.playing = false;
    }

    fn restart_load(&mut self, position: f64) {
        self.record(SurfaceCommand::RestartLoad(position));
        self.handle.state.lock().position = position;
        self.echo_load();
    }

    fn recover_decoder(&mut self) {
        self.record(SurfaceCommand::RecoverDecoder);
    }

    async fn play(&mut self) -> std::result::Result<(), PlayRejection> {
        self.record(SurfaceCommand::Play);
        let allowed = {
            let state = self.handle.state.lock();
            if state.source.is_none() {
                return Err(PlayRejection::Failed("no source".into()));
            }
            match self.options.autoplay {
                AutoplayPolicy::Allowed => true,
                AutoplayPolicy::MutedOnly => state.muted,
                AutoplayPolicy::Blocked => false,
            }
        };
        if !allowed {
            return Err(PlayRejection::AutoplayBlocked);
        }
        self.handle.state.lock().playing = true;
        self.echo(MediaEventKind::Playing);
        Ok(())
    }

    fn pause(&mut self) {
        self.record(SurfaceCommand::Pause);
        let was_playing = std::mem::replace(&mut self.handle.state.lock().playing, false);
        if was_playing {
            self.echo(MediaEventKind::Paused);
        }
    }

    fn seek(&mut self, position: f64) {
        self.record(SurfaceCommand::Seek(position));
        self.handle.state.lock().position = position;
        self.echo(MediaEventKind::TimeUpdate { position });
    }

    fn set_volume(&mut self, volume: f64) {
        self.record(SurfaceCommand::SetVolume(volume));
    }

    fn set_muted(&mut self, muted: bool) {
        self.record(SurfaceCommand::SetMuted(muted));
        self.handle.state.lock().muted = muted;
    }

    fn set_playback_rate(&mut self, rate: f64) {
        self.record(SurfaceCommand::SetPlaybackRate(rate));
    }

    fn select_variant(&mut self, level: Option<usize>) {
        self.record(SurfaceCommand::SelectVariant(level));
        if let Some(level) = level {
            self.echo(MediaEventKind::VariantSwitched { level });
        }
    }

    fn set_preload(&mut self, mode: PreloadMode) {
        self.record(SurfaceCommand::SetPreload(mode));
    }

    fn set_buffer_ahead(&mut self, seconds: f64) {
        self.record(SurfaceCommand::SetBufferAhead(seconds));
    }
}

/// Creates headless surfaces and keeps a handle to each
pub struct HeadlessFactory {
    capabilities: PlatformCapabilities,
    options: HeadlessOptions,
    handles: Mutex<Vec<HeadlessHandle>>,
}

impl HeadlessFactory {
    pub fn new(capabilities: PlatformCapabilities, options: HeadlessOptions) -> Self {
        Self {
            capabilities,
            options,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Handle of the surface created for `slot`
    pub fn handle(&self, slot: SlotId) -> Option<HeadlessHandle> {
        self.handles.lock().iter().find(|h| h.slot == slot).cloned()
    }

    pub fn handles(&self) -> Vec<HeadlessHandle> {
        self.handles.lock().clone()
    }
}

impl SurfaceFactory for HeadlessFactory {
    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    fn create(
        &self,
        slot: SlotId,
        events: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Box<dyn MediaSurface> {
        let (surface, handle) = HeadlessSurface::new(slot, events, self.options.clone());
        self.handles.lock().push(handle);
        Box::new(surface)
    }
}
