//! Platform-native adaptive engine
//!
//! The platform owns bitrate adaptation, so quality is always auto and the
//! bandwidth estimate comes from a rolling window of transfer samples.

use super::bandwidth::{TransferSample, WindowEstimator};
use super::pipeline::Pipeline;
use super::recovery::RetryTarget;
use super::surface::{MediaEventKind, MediaSurface};
use super::{EngineContext, EngineEvent};
use crate::types::QualitySelection;
use crate::{Error, Result};
use tokio::time::Instant;
use url::Url;

pub struct NativeEngine {
    pipeline: Pipeline,
    bandwidth: WindowEstimator,
}

impl NativeEngine {
    pub(crate) fn attach(surface: Box<dyn MediaSurface>, url: &Url, ctx: EngineContext) -> Self {
        Self {
            pipeline: Pipeline::new(ctx.slot, surface, url, ctx.recovery),
            bandwidth: WindowEstimator::default(),
        }
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth.estimate()
    }

    pub(crate) fn set_quality(&mut self, selection: QualitySelection) -> Result<()> {
        match selection {
            QualitySelection::Auto => Ok(()),
            QualitySelection::Level(index) => Err(Error::InvalidQuality { index, available: 0 }),
        }
    }

    pub(crate) fn handle_media_event(&mut self, kind: MediaEventKind) -> Vec<EngineEvent> {
        match kind {
            // Variant choice stays with the platform
            MediaEventKind::VariantSwitched { .. } => Vec::new(),
            MediaEventKind::Transfer { bytes, elapsed } => {
                let estimate = self.bandwidth.record(TransferSample::new(bytes, elapsed));
                vec![EngineEvent::Bandwidth(estimate)]
            }
            MediaEventKind::Error(failure) => {
                vec![self.pipeline.on_failure(failure, RetryTarget::Source)]
            }
            other => self.pipeline.translate(other).map(EngineEvent::Playback).into_iter().collect(),
        }
    }

    pub(crate) fn poll_timers(&mut self, now: Instant) {
        self.pipeline.take_due_retry(now);
    }

    pub(crate) fn destroy(self) -> Box<dyn MediaSurface> {
        self.pipeline.into_surface()
    }
}
