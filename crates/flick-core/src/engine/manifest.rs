//! Manifest-parsing adaptive engine
//!
//! Resolves the quality ladder itself, lets the caller pin a level, and
//! estimates bandwidth with an EWMA over transfer samples.

use super::bandwidth::{EwmaEstimator, TransferSample};
use super::pipeline::Pipeline;
use super::recovery::RetryTarget;
use super::surface::{MediaEventKind, MediaFailure, MediaSurface};
use super::{EngineContext, EngineEvent, EngineTaskResult};
use crate::error::StreamErrorKind;
use crate::types::{QualityLevel, QualitySelection};
use crate::{Error, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

pub struct ManifestEngine {
    pipeline: Pipeline,
    ctx: EngineContext,
    levels: Vec<QualityLevel>,
    levels_known: bool,
    selection: QualitySelection,
    current_level: Option<usize>,
    bandwidth: EwmaEstimator,
    manifest_task: Option<JoinHandle<()>>,
}

impl ManifestEngine {
    pub(crate) fn attach(surface: Box<dyn MediaSurface>, url: &Url, ctx: EngineContext) -> Self {
        let pipeline = Pipeline::new(ctx.slot, surface, url, ctx.recovery.clone());
        let mut engine = Self {
            pipeline,
            ctx,
            levels: Vec::new(),
            levels_known: false,
            selection: QualitySelection::Auto,
            current_level: None,
            bandwidth: EwmaEstimator::new(),
            manifest_task: None,
        };
        engine.fetch_manifest();
        engine
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn levels(&self) -> &[QualityLevel] {
        &self.levels
    }

    pub fn selection(&self) -> QualitySelection {
        self.selection
    }

    pub fn current_level(&self) -> Option<usize> {
        self.current_level
    }

    pub fn bandwidth_estimate(&self) -> u64 {
        self.bandwidth.estimate()
    }

    pub(crate) fn set_quality(&mut self, selection: QualitySelection) -> Result<()> {
        if let QualitySelection::Level(index) = selection {
            if self.levels_known && index >= self.levels.len() {
                return Err(Error::InvalidQuality {
                    index,
                    available: self.levels.len(),
                });
            }
        }
        self.selection = selection;
        if self.levels_known {
            self.apply_selection();
        }
        Ok(())
    }

    pub(crate) fn handle_media_event(&mut self, kind: MediaEventKind) -> Vec<EngineEvent> {
        match kind {
            MediaEventKind::VariantSwitched { level } => {
                if self.current_level == Some(level) {
                    return Vec::new();
                }
                self.current_level = Some(level);
                vec![EngineEvent::QualityChanged {
                    level: Some(level),
                    auto: self.selection.is_auto(),
                }]
            }
            MediaEventKind::Transfer { bytes, elapsed } => {
                let estimate = self.bandwidth.record(TransferSample::new(bytes, elapsed));
                vec![EngineEvent::Bandwidth(estimate)]
            }
            MediaEventKind::Error(failure) => self.fail(failure, RetryTarget::Source),
            other => self.pipeline.translate(other).map(EngineEvent::Playback).into_iter().collect(),
        }
    }

    pub(crate) fn handle_task(&mut self, result: EngineTaskResult) -> Vec<EngineEvent> {
        self.manifest_task = None;
        match result.levels {
            Ok(levels) => {
                debug!(slot = %self.pipeline.slot(), levels = levels.len(), "Manifest parsed");
                self.levels = levels;
                self.levels_known = true;
                if let QualitySelection::Level(index) = self.selection {
                    if index >= self.levels.len() {
                        self.selection = QualitySelection::Auto;
                    }
                }
                self.apply_selection();
                vec![EngineEvent::LevelsDiscovered(self.levels.clone())]
            }
            Err(e) => {
                let kind = match e {
                    Error::ManifestParse(_) => StreamErrorKind::Unsupported,
                    _ => StreamErrorKind::Network,
                };
                let failure = MediaFailure {
                    kind,
                    fatal: true,
                    details: e.to_string(),
                };
                self.fail(failure, RetryTarget::Manifest)
            }
        }
    }

    pub(crate) fn poll_timers(&mut self, now: Instant) {
        if self.pipeline.take_due_retry(now) == Some(RetryTarget::Manifest) {
            self.fetch_manifest();
        }
    }

    pub(crate) fn destroy(mut self) -> Box<dyn MediaSurface> {
        self.abort_task();
        self.pipeline.into_surface()
    }

    fn fail(&mut self, failure: MediaFailure, target: RetryTarget) -> Vec<EngineEvent> {
        let event = self.pipeline.on_failure(failure, target);
        if self.pipeline.is_failed() {
            self.abort_task();
        }
        vec![event]
    }

    fn apply_selection(&mut self) {
        let variant = match self.selection {
            QualitySelection::Auto => None,
            QualitySelection::Level(index) => Some(index),
        };
        self.pipeline.surface_mut().select_variant(variant);
    }

    fn fetch_manifest(&mut self) {
        let Some(loader) = self.ctx.loader.clone() else {
            // No loader: the pipeline adapts on its own
            self.levels_known = true;
            return;
        };
        self.abort_task();

        let tasks = self.ctx.tasks.clone();
        let slot = self.ctx.slot;
        let token = self.pipeline.token();
        let url = self.pipeline.url().clone();

        self.manifest_task = Some(tokio::spawn(async move {
            let levels = loader.load_levels(&url).await;
            let _ = tasks.send(EngineTaskResult { slot, token, levels });
        }));
    }

    fn abort_task(&mut self) {
        if let Some(task) = self.manifest_task.take() {
            task.abort();
        }
    }
}
