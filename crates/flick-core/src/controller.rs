//! Playback controller
//!
//! Composes one [`StreamEngine`], the [`PlaybackStateMachine`] and the
//! session transport state into a single controllable unit. The controller
//! owns its render surface for its whole life: the surface is parked here
//! while no engine is attached and handed to each new engine on attach.
//!
//! Only fatal stream errors and autoplay results cross this boundary; every
//! recoverable error stays inside the engine and shows up in analytics only.

use crate::analytics::{AnalyticsSink, AnalyticsSnapshot, AnalyticsTracker, QualityChangeReason};
use crate::config::{ControllerConfig, RecoveryConfig, StateMachineConfig};
use crate::engine::{
    EngineContext, EngineEvent, EngineKind, EngineTaskResult, ManifestLoader, MediaEvent,
    MediaSurface, PlayRejection, PlaybackSignal, PreloadMode, StreamEngine,
};
use crate::error::StreamError;
use crate::events::{FeedEvent, PlayOutcome};
use crate::network::{BufferRecommendation, NetworkInfo};
use crate::policy::{ArbiterDecision, AutoPauseArbiter, Inhibitor};
use crate::power::PowerInfo;
use crate::preferences::{PlaybackPreferences, PreferenceStore};
use crate::session::{PlaybackSession, SessionSnapshot};
use crate::state_machine::{PlaybackStateMachine, StateChange};
use crate::types::*;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

pub const MIN_PLAYBACK_RATE: f64 = 0.25;
pub const MAX_PLAYBACK_RATE: f64 = 4.0;

/// Shared wiring for every controller in a pool
#[derive(Clone)]
pub struct ControllerOptions {
    pub state_machine: StateMachineConfig,
    pub recovery: RecoveryConfig,
    pub policy: ControllerConfig,
    pub engine_kind: EngineKind,
    pub loader: Option<Arc<dyn ManifestLoader>>,
    pub engine_tasks: mpsc::UnboundedSender<EngineTaskResult>,
    pub events: mpsc::UnboundedSender<FeedEvent>,
    pub preferences: Option<Arc<dyn PreferenceStore>>,
    pub analytics: Option<AnalyticsSink>,
}

/// One engine plus transport state
pub struct PlaybackController {
    slot: SlotId,
    options: ControllerOptions,
    parked: Option<Box<dyn MediaSurface>>,
    engine: Option<StreamEngine>,
    machine: PlaybackStateMachine,
    session: Option<PlaybackSession>,
    video: Option<VideoItem>,
    analytics: Option<AnalyticsTracker>,
    arbiter: AutoPauseArbiter,
    resource_class: ResourceClass,
    preferred_quality: QualitySelection,
    forced_low: bool,
    buffer_ahead: Option<f64>,
    /// Start playback as soon as the source can play
    play_when_ready: bool,
    quality_reason: Option<QualityChangeReason>,
}

impl PlaybackController {
    pub fn new(slot: SlotId, surface: Box<dyn MediaSurface>, options: ControllerOptions) -> Self {
        Self {
            slot,
            machine: PlaybackStateMachine::new(&options.state_machine),
            options,
            parked: Some(surface),
            engine: None,
            session: None,
            video: None,
            analytics: None,
            arbiter: AutoPauseArbiter::new(),
            resource_class: ResourceClass::Metadata,
            preferred_quality: QualitySelection::Auto,
            forced_low: false,
            buffer_ahead: None,
            play_when_ready: false,
            quality_reason: None,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn video(&self) -> Option<&VideoItem> {
        self.video.as_ref()
    }

    pub fn state(&self) -> PlayerState {
        self.machine.state()
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.engine.as_ref().map(|e| e.kind())
    }

    pub fn resource_class(&self) -> ResourceClass {
        self.resource_class
    }

    pub fn inhibitors(&self) -> Vec<Inhibitor> {
        self.arbiter.inhibitors()
    }

    pub fn is_forced_low_quality(&self) -> bool {
        self.forced_low
    }

    /// A session is attached but its engine gave up
    pub fn is_failed(&self) -> bool {
        self.session.is_some() && self.engine.is_none()
    }

    /// Observe committed state changes of this controller's machine
    pub fn subscribe(&self) -> Option<tokio::sync::broadcast::Receiver<StateChange>> {
        self.machine.subscribe()
    }

    pub fn slot_state(&self) -> SlotState {
        let Some(session) = &self.session else {
            return SlotState::Empty;
        };
        match self.machine.state() {
            PlayerState::Idle | PlayerState::Loading | PlayerState::Error => SlotState::Preparing,
            PlayerState::Ready => SlotState::Ready,
            PlayerState::Buffering | PlayerState::Stalled if !session.started => SlotState::Preparing,
            PlayerState::Playing | PlayerState::Buffering | PlayerState::Stalled => SlotState::Active,
            PlayerState::Paused | PlayerState::Ended => SlotState::Paused,
        }
    }

    /// Attach a video, tearing down whatever was attached before
    #[instrument(skip(self, video), fields(slot = %self.slot, video = %video.id))]
    pub fn attach(&mut self, video: &VideoItem, class: ResourceClass) -> Result<()> {
        if self.session.is_some() {
            self.detach();
        }
        let surface = self.take_surface()?;

        let prefs = self
            .options
            .preferences
            .as_ref()
            .map(|store| store.get())
            .unwrap_or_else(|| PlaybackPreferences {
                volume: self.options.policy.default_volume,
                ..Default::default()
            });

        let mut session = PlaybackSession::new(video);
        session.volume = sanitize_volume(prefs.volume);
        session.muted = prefs.muted || session.volume == 0.0;
        session.playback_rate = clamp_rate(prefs.playback_rate);
        self.preferred_quality = prefs.quality;

        let engine = StreamEngine::attach(self.options.engine_kind, surface, &video.url, self.engine_context());
        if engine.kind() == EngineKind::Native {
            self.preferred_quality = QualitySelection::Auto;
        }
        session.quality_selection = if self.forced_low {
            QualitySelection::Level(0)
        } else {
            self.preferred_quality
        };

        self.analytics = self.options.policy.analytics_enabled.then(|| {
            let mut tracker = AnalyticsTracker::new(session.id, video.id.clone(), self.options.analytics.clone());
            tracker.record_load(&video.url);
            tracker
        });
        self.session = Some(session);
        self.video = Some(video.clone());
        self.engine = Some(engine);
        self.resource_class = class;
        self.play_when_ready = false;
        self.quality_reason = None;
        self.arbiter.forget();
        self.configure_surface();

        self.apply_state(PlayerState::Loading);
        info!(class = %class, "Video attached");
        Ok(())
    }

    /// Detach the current video and finalize its analytics
    #[instrument(skip(self), fields(slot = %self.slot))]
    pub fn detach(&mut self) -> Option<AnalyticsSnapshot> {
        self.session.as_ref()?;
        self.apply_state(PlayerState::Idle);

        if let Some(engine) = self.engine.take() {
            self.parked = Some(engine.destroy());
        }
        let position = self.session.take().map(|s| s.current_time).unwrap_or(0.0);
        let snapshot = self.analytics.take().map(|mut tracker| tracker.finalize(position));
        let video = self.video.take();
        self.play_when_ready = false;
        self.quality_reason = None;
        self.arbiter.forget();

        if let Some(analytics) = &snapshot {
            self.emit(FeedEvent::SessionEnded {
                slot: self.slot,
                analytics: analytics.clone(),
            });
        }
        if let Some(video) = video {
            info!(video = %video.id, "Video detached");
        }
        snapshot
    }

    /// Change how much of the attached source should be prepared
    pub fn set_resource_class(&mut self, class: ResourceClass) {
        if class == self.resource_class {
            return;
        }
        debug!(slot = %self.slot, from = %self.resource_class, to = %class, "Resource class changed");
        self.resource_class = class;
        if let Some(engine) = self.engine.as_mut() {
            engine.surface_mut().set_preload(preload_mode(class));
        }
    }

    /// User-initiated play; retries muted when autoplay is blocked
    #[instrument(skip(self), fields(slot = %self.slot))]
    pub async fn play(&mut self) -> PlayOutcome {
        self.arbiter.forget();
        self.start_playback().await
    }

    /// Play on activation; held back while loading or inhibited
    pub async fn autoplay(&mut self) -> PlayOutcome {
        if self.session.is_none() {
            return PlayOutcome::NoSession;
        }
        if self.arbiter.is_inhibited() {
            self.arbiter.defer_playback();
            debug!(slot = %self.slot, inhibitors = ?self.arbiter.inhibitors(), "Autoplay deferred");
            return PlayOutcome::Deferred;
        }
        if matches!(self.machine.state(), PlayerState::Idle | PlayerState::Loading) {
            self.play_when_ready = true;
            return PlayOutcome::Deferred;
        }
        self.start_playback().await
    }

    /// User-initiated pause
    pub fn pause(&mut self) -> Result<()> {
        self.arbiter.forget();
        self.suspend()
    }

    /// Pause without touching the remembered auto-pause state
    pub fn suspend(&mut self) -> Result<()> {
        self.play_when_ready = false;
        let engine = self.engine.as_mut().ok_or(Error::NoSession(self.slot))?;
        engine.surface_mut().pause();
        Ok(())
    }

    /// Pause when playing, play otherwise
    pub async fn toggle_play(&mut self) -> Option<PlayOutcome> {
        if self.is_playing() {
            if let Err(e) = self.pause() {
                debug!(slot = %self.slot, error = %e, "Toggle ignored");
            }
            None
        } else {
            Some(self.play().await)
        }
    }

    /// Seek, clamped to `[0, duration]`; returns the applied position
    pub fn seek(&mut self, position: f64) -> Result<f64> {
        let session = self.session.as_mut().ok_or(Error::NoSession(self.slot))?;
        let from = session.current_time;
        let target = session.clamp_position(position);
        session.current_time = target;

        if let Some(engine) = self.engine.as_mut() {
            engine.surface_mut().seek(target);
        }
        if let Some(tracker) = self.analytics.as_mut() {
            tracker.record_seek(from, target);
        }
        info!(slot = %self.slot, from, to = target, "Seeking");
        Ok(target)
    }

    /// Set volume; zero mutes, any audible volume unmutes
    pub fn set_volume(&mut self, volume: f64) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NoSession(self.slot))?;
        session.volume = sanitize_volume(volume);
        if session.volume == 0.0 {
            session.muted = true;
        } else if session.muted {
            session.muted = false;
        }
        let (volume, muted) = (session.volume, session.muted);

        if let Some(engine) = self.engine.as_mut() {
            let surface = engine.surface_mut();
            surface.set_volume(volume);
            surface.set_muted(muted);
        }
        self.store_preferences();
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let default_volume = self.options.policy.default_volume;
        let session = self.session.as_mut().ok_or(Error::NoSession(self.slot))?;
        session.muted = muted;
        if !muted && session.volume == 0.0 {
            session.volume = if default_volume > 0.0 { default_volume } else { 1.0 };
        }
        let (volume, muted) = (session.volume, session.muted);

        if let Some(engine) = self.engine.as_mut() {
            let surface = engine.surface_mut();
            surface.set_volume(volume);
            surface.set_muted(muted);
        }
        self.store_preferences();
        Ok(())
    }

    pub fn toggle_mute(&mut self) -> Result<()> {
        let muted = self.session.as_ref().ok_or(Error::NoSession(self.slot))?.muted;
        self.set_muted(!muted)
    }

    /// Set playback rate, clamped to `[0.25, 4.0]`; returns the applied rate
    pub fn set_playback_rate(&mut self, rate: f64) -> Result<f64> {
        let session = self.session.as_mut().ok_or(Error::NoSession(self.slot))?;
        session.playback_rate = clamp_rate(rate);
        let rate = session.playback_rate;
        if let Some(engine) = self.engine.as_mut() {
            engine.surface_mut().set_playback_rate(rate);
        }
        self.store_preferences();
        Ok(rate)
    }

    /// Select a quality level or return to auto
    pub fn set_quality(&mut self, selection: QualitySelection) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::NoSession(self.slot));
        }
        let engine = self.engine.as_mut().ok_or(Error::NoSession(self.slot))?;

        if self.forced_low {
            // Remembered and applied once the network recovers
            if let QualitySelection::Level(index) = selection {
                let available = engine.levels().len();
                if engine.kind() == EngineKind::Native || (available > 0 && index >= available) {
                    return Err(Error::InvalidQuality { index, available });
                }
            }
        } else {
            engine.set_quality(selection)?;
            self.quality_reason = Some(QualityChangeReason::Manual);
            if let Some(session) = self.session.as_mut() {
                session.quality_selection = selection;
            }
        }

        self.preferred_quality = selection;
        self.store_preferences();
        Ok(())
    }

    /// Seconds of contiguous buffer ahead of the cursor
    pub fn get_buffered(&self) -> f64 {
        self.session.as_ref().map(|s| s.buffered_ahead()).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.session.as_ref().map(|s| s.snapshot())
    }

    pub fn analytics_snapshot(&self) -> Option<AnalyticsSnapshot> {
        self.analytics.as_ref().map(|a| a.snapshot())
    }

    /// Reload after a fatal error or a stall
    #[instrument(skip(self), fields(slot = %self.slot))]
    pub fn retry(&mut self) -> Result<()> {
        let video = self.video.clone().ok_or(Error::NoSession(self.slot))?;

        if let Some(engine) = self.engine.as_mut() {
            if self.machine.state() == PlayerState::Stalled {
                let position = self.session.as_ref().map(|s| s.current_time).unwrap_or(0.0);
                engine.surface_mut().restart_load(position);
                self.apply_state(PlayerState::Loading);
            }
            return Ok(());
        }

        let surface = self.take_surface()?;
        let engine = StreamEngine::attach(self.options.engine_kind, surface, &video.url, self.engine_context());
        self.engine = Some(engine);
        if let Some(session) = self.session.as_mut() {
            session.quality_levels.clear();
            session.current_quality_index = None;
            session.buffered_ranges.clear();
        }
        self.configure_surface();
        self.apply_state(PlayerState::Loading);
        info!(video = %video.id, "Retrying playback");
        Ok(())
    }

    /// Handle an event from this controller's surface
    pub async fn handle_media_event(&mut self, event: MediaEvent) {
        let Some(engine) = self.engine.as_mut() else {
            debug!(slot = %self.slot, token = %event.token, "Media event without engine");
            return;
        };
        for engine_event in engine.handle_media_event(event) {
            self.apply_engine_event(engine_event).await;
        }
    }

    /// Handle background engine work
    pub async fn handle_engine_task(&mut self, result: EngineTaskResult) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        for engine_event in engine.handle_task(result) {
            self.apply_engine_event(engine_event).await;
        }
    }

    /// Fire the stall timer and engine retries that are due
    pub fn poll_timers(&mut self, now: Instant) {
        if let Some(change) = self.machine.on_stall_timer(now) {
            self.on_state_committed(change);
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.poll_timers(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let stall = self.machine.stall_deadline();
        let retry = self.engine.as_ref().and_then(|e| e.next_deadline());
        match (stall, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Apply connectivity: buffer hint, forced low quality, offline pause
    pub async fn apply_network(&mut self, info: &NetworkInfo, recommendation: &BufferRecommendation) {
        if recommendation.buffer_ahead_secs > 0.0 {
            self.buffer_ahead = Some(recommendation.buffer_ahead_secs);
            if let Some(engine) = self.engine.as_mut() {
                engine.surface_mut().set_buffer_ahead(recommendation.buffer_ahead_secs);
            }
        }

        if self.options.policy.auto_quality_on_network_change {
            self.set_forced_low(recommendation.force_low_quality);
        }

        if self.options.policy.auto_pause_on_offline {
            let decision = if info.class == ConnectionClass::Offline {
                let playing = self.take_playing_intent();
                self.arbiter.engage(Inhibitor::Offline, playing)
            } else {
                self.arbiter.release(Inhibitor::Offline)
            };
            self.apply_decision(decision, Inhibitor::Offline).await;
        }
    }

    /// Apply battery state: low-battery pause
    pub async fn apply_power(&mut self, info: &PowerInfo) {
        if !self.options.policy.auto_pause_on_low_battery {
            return;
        }
        let decision = if info.power_saving {
            let playing = self.take_playing_intent();
            self.arbiter.engage(Inhibitor::LowBattery, playing)
        } else {
            self.arbiter.release(Inhibitor::LowBattery)
        };
        self.apply_decision(decision, Inhibitor::LowBattery).await;
    }

    fn is_playing(&self) -> bool {
        matches!(
            self.machine.state(),
            PlayerState::Playing | PlayerState::Buffering | PlayerState::Stalled
        )
    }

    /// Whether playback is running or about to start; a pending start is
    /// handed over to the arbiter
    fn take_playing_intent(&mut self) -> bool {
        self.is_playing() || std::mem::take(&mut self.play_when_ready)
    }

    async fn apply_decision(&mut self, decision: ArbiterDecision, inhibitor: Inhibitor) {
        match decision {
            ArbiterDecision::Nothing => {}
            ArbiterDecision::Pause => {
                info!(slot = %self.slot, %inhibitor, "Auto-pausing playback");
                if let Some(engine) = self.engine.as_mut() {
                    engine.surface_mut().pause();
                }
                self.emit(FeedEvent::AutoPaused {
                    slot: self.slot,
                    inhibitor,
                });
            }
            ArbiterDecision::Resume => {
                info!(slot = %self.slot, %inhibitor, "Auto-resuming playback");
                let outcome = if matches!(self.machine.state(), PlayerState::Idle | PlayerState::Loading) {
                    self.play_when_ready = true;
                    PlayOutcome::Deferred
                } else {
                    self.start_playback().await
                };
                debug!(slot = %self.slot, ?outcome, "Auto-resume outcome");
                self.emit(FeedEvent::AutoResumed { slot: self.slot });
            }
        }
    }

    fn set_forced_low(&mut self, force: bool) {
        if force == self.forced_low {
            return;
        }
        self.forced_low = force;
        info!(slot = %self.slot, forced_low = force, "Low quality mode changed");

        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        if engine.kind() != EngineKind::Manifest {
            return;
        }

        let target = if force {
            QualitySelection::Level(0)
        } else {
            self.preferred_quality
        };
        if force && engine.levels().is_empty() {
            // Applied once the ladder is known
            if let Some(session) = self.session.as_mut() {
                session.quality_selection = target;
            }
            return;
        }

        let applied = match engine.set_quality(target) {
            Ok(()) => target,
            Err(e) => {
                warn!(slot = %self.slot, error = %e, "Preferred quality unavailable, using auto");
                let _ = engine.set_quality(QualitySelection::Auto);
                QualitySelection::Auto
            }
        };
        self.quality_reason = Some(QualityChangeReason::Network);
        if let Some(session) = self.session.as_mut() {
            session.quality_selection = applied;
        }
    }

    async fn start_playback(&mut self) -> PlayOutcome {
        self.play_when_ready = false;
        let fallback = self.options.policy.muted_autoplay_fallback;
        if self.session.is_none() {
            return PlayOutcome::NoSession;
        }
        let (Some(session), Some(engine)) = (self.session.as_mut(), self.engine.as_mut()) else {
            return PlayOutcome::Failed {
                reason: "stream failed, retry required".into(),
            };
        };

        let outcome = match engine.play().await {
            Ok(()) => PlayOutcome::Started { muted_fallback: false },
            Err(PlayRejection::AutoplayBlocked) if fallback && !session.muted => {
                debug!(slot = %self.slot, "Autoplay blocked, retrying muted");
                engine.surface_mut().set_muted(true);
                match engine.play().await {
                    Ok(()) => {
                        session.muted = true;
                        PlayOutcome::Started { muted_fallback: true }
                    }
                    Err(rejection) => {
                        engine.surface_mut().set_muted(false);
                        rejection_outcome(rejection)
                    }
                }
            }
            Err(rejection) => rejection_outcome(rejection),
        };

        if outcome == PlayOutcome::GestureRequired {
            if let Some(video) = &self.video {
                info!(slot = %self.slot, video = %video.id, "Playback needs a user gesture");
                self.emit(FeedEvent::GestureRequired {
                    slot: self.slot,
                    video_id: video.id.clone(),
                });
            }
        }
        outcome
    }

    async fn apply_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Playback(signal) => self.apply_signal(signal).await,
            EngineEvent::LevelsDiscovered(levels) => {
                if let Some(session) = self.session.as_mut() {
                    session.quality_levels = levels.clone();
                }
                if let Some(video) = &self.video {
                    self.emit(FeedEvent::QualityLevels {
                        slot: self.slot,
                        video_id: video.id.clone(),
                        levels: levels.clone(),
                    });
                }
                if self.forced_low && !levels.is_empty() {
                    if let Some(engine) = self.engine.as_mut() {
                        if engine.set_quality(QualitySelection::Level(0)).is_ok() {
                            self.quality_reason = Some(QualityChangeReason::Network);
                        }
                    }
                }
            }
            EngineEvent::QualityChanged { level, auto } => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.current_quality_index == level {
                    return;
                }
                let from = session.current_quality_index;
                let bitrate = level
                    .and_then(|i| session.quality_levels.get(i))
                    .map(|l| l.bitrate_bps)
                    .unwrap_or(0);
                session.current_quality_index = level;
                let video_id = session.video_id.clone();

                let reason = if auto {
                    QualityChangeReason::Abr
                } else {
                    self.quality_reason.take().unwrap_or(QualityChangeReason::Manual)
                };
                if let Some(tracker) = self.analytics.as_mut() {
                    tracker.record_quality_switch(from, level, bitrate, reason);
                }
                self.emit(FeedEvent::QualityChanged {
                    slot: self.slot,
                    video_id,
                    level,
                    auto,
                });
            }
            EngineEvent::Bandwidth(bps) => {
                if let Some(session) = self.session.as_mut() {
                    session.bandwidth_estimate = bps;
                }
            }
            EngineEvent::Error(err) => {
                let position = self.session.as_ref().map(|s| s.current_time).unwrap_or(0.0);
                if let Some(tracker) = self.analytics.as_mut() {
                    tracker.record_error(&err, position);
                }
                if err.is_fatal() {
                    self.fail(err);
                } else {
                    debug!(slot = %self.slot, error = %err, "Recoverable stream error");
                }
            }
        }
    }

    async fn apply_signal(&mut self, signal: PlaybackSignal) {
        match signal {
            PlaybackSignal::Loading => {
                self.apply_state(PlayerState::Loading);
            }
            PlaybackSignal::MetadataLoaded { duration } => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(duration) = duration.filter(|d| d.is_finite() && *d > 0.0) {
                        session.duration = Some(duration);
                    }
                }
            }
            PlaybackSignal::Ready => {
                if matches!(
                    self.machine.state(),
                    PlayerState::Loading | PlayerState::Buffering | PlayerState::Stalled
                ) {
                    self.apply_state(PlayerState::Ready);
                }
                if self.play_when_ready {
                    let outcome = self.start_playback().await;
                    debug!(slot = %self.slot, ?outcome, "Deferred playback started");
                }
            }
            PlaybackSignal::Playing => {
                if let Some(session) = self.session.as_mut() {
                    session.started = true;
                }
                if self.machine.state() == PlayerState::Loading {
                    self.apply_state(PlayerState::Ready);
                }
                self.apply_state(PlayerState::Playing);
            }
            PlaybackSignal::Paused => {
                self.apply_state(PlayerState::Paused);
            }
            PlaybackSignal::Buffering => {
                self.apply_state(PlayerState::Buffering);
            }
            PlaybackSignal::Ended => {
                self.apply_state(PlayerState::Ended);
            }
            PlaybackSignal::Position(position) => {
                if let Some(session) = self.session.as_mut() {
                    session.current_time = position;
                }
            }
            PlaybackSignal::Buffered(ranges) => {
                if let Some(session) = self.session.as_mut() {
                    session.buffered_ranges = ranges;
                }
            }
        }
    }

    fn fail(&mut self, err: StreamError) {
        let Some(video) = self.video.clone() else {
            return;
        };
        error!(slot = %self.slot, video = %video.id, error = %err, "Playback failed");

        self.apply_state(PlayerState::Error);
        if let Some(engine) = self.engine.take() {
            self.parked = Some(engine.destroy());
        }
        self.play_when_ready = false;
        self.emit(FeedEvent::Fatal {
            slot: self.slot,
            video_id: video.id,
            error: err,
        });
    }

    /// Commit a transition if the table allows it; signals outside the
    /// table are dropped
    fn apply_state(&mut self, to: PlayerState) -> bool {
        let from = self.machine.state();
        if from == to {
            return false;
        }
        if !self.machine.can_transition(to) {
            debug!(slot = %self.slot, from = %from, to = %to, "Ignoring signal outside transition table");
            return false;
        }
        match self.machine.transition(to) {
            Ok(change) => {
                self.on_state_committed(change);
                true
            }
            Err(_) => false,
        }
    }

    fn on_state_committed(&mut self, change: StateChange) {
        let position = self.session.as_ref().map(|s| s.current_time).unwrap_or(0.0);
        if let Some(session) = self.session.as_mut() {
            session.state = change.state;
        }
        if let Some(tracker) = self.analytics.as_mut() {
            tracker.record_state(change.previous, change.state, position);
        }
        if let Some(video) = &self.video {
            self.emit(FeedEvent::StateChanged {
                slot: self.slot,
                video_id: video.id.clone(),
                state: change.state,
                previous: change.previous,
            });
        }
    }

    fn configure_surface(&mut self) {
        let (Some(session), Some(engine)) = (self.session.as_ref(), self.engine.as_mut()) else {
            return;
        };
        if !self.forced_low {
            if let Err(e) = engine.set_quality(session.quality_selection) {
                debug!(slot = %self.slot, error = %e, "Stored quality not applicable");
            }
        }
        let surface = engine.surface_mut();
        surface.set_volume(session.volume);
        surface.set_muted(session.muted);
        surface.set_playback_rate(session.playback_rate);
        surface.set_preload(preload_mode(self.resource_class));
        if let Some(seconds) = self.buffer_ahead {
            surface.set_buffer_ahead(seconds);
        }
    }

    fn engine_context(&self) -> EngineContext {
        EngineContext {
            slot: self.slot,
            loader: self.options.loader.clone(),
            tasks: self.options.engine_tasks.clone(),
            recovery: self.options.recovery.clone(),
        }
    }

    fn take_surface(&mut self) -> Result<Box<dyn MediaSurface>> {
        self.parked
            .take()
            .ok_or_else(|| Error::Internal(format!("render surface of {} is not available", self.slot)))
    }

    fn store_preferences(&self) {
        let (Some(store), Some(session)) = (&self.options.preferences, &self.session) else {
            return;
        };
        store.set(PlaybackPreferences {
            volume: session.volume,
            muted: session.muted,
            playback_rate: session.playback_rate,
            quality: self.preferred_quality,
        });
    }

    fn emit(&self, event: FeedEvent) {
        let _ = self.options.events.send(event);
    }
}

fn rejection_outcome(rejection: PlayRejection) -> PlayOutcome {
    match rejection {
        PlayRejection::AutoplayBlocked => PlayOutcome::GestureRequired,
        PlayRejection::Failed(reason) => PlayOutcome::Failed { reason },
    }
}

fn preload_mode(class: ResourceClass) -> PreloadMode {
    match class {
        ResourceClass::Metadata => PreloadMode::Metadata,
        ResourceClass::Partial | ResourceClass::Full => PreloadMode::Auto,
    }
}

fn sanitize_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_finite() {
        rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
    } else {
        1.0
    }
}
