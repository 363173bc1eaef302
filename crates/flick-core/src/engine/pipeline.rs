//! Surface ownership and event translation shared by both engine variants

use super::recovery::{RecoveryAction, RecoveryPolicy, RetryTarget};
use super::surface::{MediaFailure, MediaEventKind, MediaSurface};
use super::{EngineEvent, PlaybackSignal};
use crate::config::RecoveryConfig;
use crate::error::StreamError;
use crate::types::{SlotId, SourceToken};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use url::Url;

pub(crate) struct Pipeline {
    slot: SlotId,
    surface: Box<dyn MediaSurface>,
    token: SourceToken,
    url: Url,
    recovery: RecoveryPolicy,
    retry: Option<(Instant, RetryTarget)>,
    position: f64,
    failed: bool,
}

impl Pipeline {
    /// Take ownership of `surface` and attach `url` to it
    pub(crate) fn new(
        slot: SlotId,
        surface: Box<dyn MediaSurface>,
        url: &Url,
        recovery: RecoveryConfig,
    ) -> Self {
        let mut pipeline = Self {
            slot,
            surface,
            token: SourceToken::issue(),
            url: url.clone(),
            recovery: RecoveryPolicy::new(recovery),
            retry: None,
            position: 0.0,
            failed: false,
        };
        pipeline.load(url);
        pipeline
    }

    /// Point the surface at a new source under a fresh token
    pub(crate) fn load(&mut self, url: &Url) -> SourceToken {
        self.token = SourceToken::issue();
        self.url = url.clone();
        self.retry = None;
        self.position = 0.0;
        self.failed = false;
        self.surface.set_source(url, self.token);
        debug!(slot = %self.slot, token = %self.token, url = %url, "Source attached");
        self.token
    }

    pub(crate) fn slot(&self) -> SlotId {
        self.slot
    }

    pub(crate) fn token(&self) -> SourceToken {
        self.token
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn surface_mut(&mut self) -> &mut dyn MediaSurface {
        self.surface.as_mut()
    }

    /// Map a transport event to the engine-agnostic signal
    pub(crate) fn translate(&mut self, kind: MediaEventKind) -> Option<PlaybackSignal> {
        let signal = match kind {
            MediaEventKind::LoadStart => PlaybackSignal::Loading,
            MediaEventKind::LoadedMetadata { duration } => PlaybackSignal::MetadataLoaded { duration },
            MediaEventKind::CanPlay => PlaybackSignal::Ready,
            MediaEventKind::Playing => {
                self.recovery.on_playing();
                PlaybackSignal::Playing
            }
            MediaEventKind::Paused => PlaybackSignal::Paused,
            MediaEventKind::Waiting => PlaybackSignal::Buffering,
            MediaEventKind::Ended => PlaybackSignal::Ended,
            MediaEventKind::TimeUpdate { position } => {
                self.position = position;
                PlaybackSignal::Position(position)
            }
            MediaEventKind::Progress { buffered } => PlaybackSignal::Buffered(buffered),
            MediaEventKind::VariantSwitched { .. }
            | MediaEventKind::Transfer { .. }
            | MediaEventKind::Error(_) => return None,
        };
        Some(signal)
    }

    /// Classify a pipeline failure and start whatever recovery applies
    pub(crate) fn on_failure(&mut self, failure: MediaFailure, target: RetryTarget) -> EngineEvent {
        if self.failed {
            return EngineEvent::Error(StreamError::fatal(failure.kind, failure.details));
        }

        match self.recovery.on_failure(failure.kind, failure.fatal, target) {
            RecoveryAction::Ignore => {
                debug!(slot = %self.slot, kind = %failure.kind, details = %failure.details, "Non-fatal stream error");
            }
            RecoveryAction::Retry { attempt, delay, target } => {
                warn!(
                    slot = %self.slot,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    details = %failure.details,
                    "Network error, scheduling reload"
                );
                self.retry = Some((Instant::now() + delay, target));
            }
            RecoveryAction::RecoverDecoder { attempt } => {
                warn!(slot = %self.slot, attempt, details = %failure.details, "Decode error, recovering decoder");
                self.surface.recover_decoder();
            }
            RecoveryAction::GiveUp => {
                error!(slot = %self.slot, kind = %failure.kind, details = %failure.details, "Stream failed");
                self.failed = true;
                self.retry = None;
                self.surface.clear_source();
                return EngineEvent::Error(StreamError::fatal(failure.kind, failure.details));
            }
        }

        EngineEvent::Error(StreamError::recoverable(failure.kind, failure.details))
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.retry.map(|(deadline, _)| deadline)
    }

    /// Fire a due retry; source reloads are issued here, manifest refetches
    /// are left to the caller
    pub(crate) fn take_due_retry(&mut self, now: Instant) -> Option<RetryTarget> {
        let (deadline, target) = self.retry?;
        if now < deadline {
            return None;
        }
        self.retry = None;
        if target == RetryTarget::Source {
            debug!(slot = %self.slot, position = self.position, "Reloading source");
            self.surface.restart_load(self.position);
        }
        Some(target)
    }

    /// Release the surface with no source attached
    pub(crate) fn into_surface(mut self) -> Box<dyn MediaSurface> {
        if !self.failed {
            self.surface.clear_source();
        }
        self.surface
    }
}
