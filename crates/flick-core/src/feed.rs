//! Feed root
//!
//! [`Feed`] owns one instance of every component (pool, preload scheduler,
//! memory governor, network and power monitors), all constructor-injected.
//! It applies index changes, gesture intents and platform signals, and
//! reports diagnostics. Asynchronous inputs (surface events, engine task
//! results, preload completions) arrive on the receivers in
//! [`FeedChannels`] and are fed back by the caller, usually a
//! [`FeedRuntime`](crate::runtime::FeedRuntime).

use crate::analytics::{AnalyticsSink, AnalyticsSnapshot};
use crate::config::FlickConfig;
use crate::controller::ControllerOptions;
use crate::engine::{
    EngineKind, EngineTaskResult, ManifestLoader, SurfaceEvent, SurfaceFactory, TransferSample, WindowEstimator,
};
use crate::events::{FeedEvent, Intent, PlayOutcome};
use crate::memory::{MemoryGovernor, MemoryStats};
use crate::network::{NetworkInfo, NetworkMonitor, NetworkProbe, NetworkSample};
use crate::pool::{EnginePool, PoolUpdate, SlotInfo};
use crate::power::{PowerInfo, PowerMonitor, PowerProbe, PowerSample};
use crate::preferences::PreferenceStore;
use crate::preload::{FetchCompletion, PauseReason, PreloadScheduler, PreloadStats, ResourceFetcher};
use crate::session::SessionSnapshot;
use crate::types::VideoItem;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Platform collaborators of a feed
pub struct FeedDeps {
    pub surfaces: Arc<dyn SurfaceFactory>,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub loader: Option<Arc<dyn ManifestLoader>>,
    pub preferences: Option<Arc<dyn PreferenceStore>>,
    pub network_probe: Option<Box<dyn NetworkProbe>>,
    pub power_probe: Option<Box<dyn PowerProbe>>,
    pub analytics: Option<AnalyticsSink>,
}

impl FeedDeps {
    pub fn new(surfaces: Arc<dyn SurfaceFactory>, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            surfaces,
            fetcher,
            loader: None,
            preferences: None,
            network_probe: None,
            power_probe: None,
            analytics: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn with_network_probe(mut self, probe: Box<dyn NetworkProbe>) -> Self {
        self.network_probe = Some(probe);
        self
    }

    pub fn with_power_probe(mut self, probe: Box<dyn PowerProbe>) -> Self {
        self.power_probe = Some(probe);
        self
    }

    pub fn with_analytics(mut self, sink: AnalyticsSink) -> Self {
        self.analytics = Some(sink);
        self
    }
}

/// Receivers for everything a feed produces asynchronously
pub struct FeedChannels {
    pub surface_events: mpsc::UnboundedReceiver<SurfaceEvent>,
    pub engine_tasks: mpsc::UnboundedReceiver<EngineTaskResult>,
    pub completions: mpsc::UnboundedReceiver<FetchCompletion>,
    /// Events for the UI layer
    pub events: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Diagnostics for overlays
#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub current_index: Option<usize>,
    pub video_count: usize,
    pub engine: EngineKind,
    pub slots: Vec<SlotInfo>,
    pub memory: MemoryStats,
    pub preload: PreloadStats,
    pub preload_bandwidth_bps: u64,
    pub network: NetworkInfo,
    pub power: PowerInfo,
}

pub struct Feed {
    config: FlickConfig,
    engine_kind: EngineKind,
    videos: Vec<VideoItem>,
    pool: EnginePool,
    scheduler: PreloadScheduler,
    governor: MemoryGovernor,
    network: NetworkMonitor,
    power: PowerMonitor,
    preload_bandwidth: WindowEstimator,
}

impl Feed {
    pub fn new(config: FlickConfig, deps: FeedDeps) -> Result<(Self, FeedChannels)> {
        config.validate()?;

        let (surface_tx, surface_events) = mpsc::unbounded_channel();
        let (task_tx, engine_tasks) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let engine_kind = EngineKind::select(&deps.surfaces.capabilities(), deps.loader.is_some());
        let options = ControllerOptions {
            state_machine: config.state_machine.clone(),
            recovery: config.recovery.clone(),
            policy: config.controller.clone(),
            engine_kind,
            loader: deps.loader,
            engine_tasks: task_tx,
            events: event_tx,
            preferences: deps.preferences,
            analytics: deps.analytics,
        };

        let pool = EnginePool::new(config.pool.clone(), deps.surfaces.as_ref(), surface_tx, options);
        let scheduler = PreloadScheduler::new(config.preload.clone(), deps.fetcher, completion_tx);
        let governor = MemoryGovernor::new(config.memory.clone());
        let network = NetworkMonitor::new(config.network.clone(), deps.network_probe);
        let power = PowerMonitor::new(config.power.clone(), deps.power_probe);

        info!(engine = %engine_kind, slots = config.pool.slot_count, "Feed created");

        let feed = Self {
            config,
            engine_kind,
            videos: Vec::new(),
            pool,
            scheduler,
            governor,
            network,
            power,
            preload_bandwidth: WindowEstimator::new(WindowEstimator::DEFAULT_WINDOW),
        };
        let channels = FeedChannels {
            surface_events,
            engine_tasks,
            completions,
            events,
        };
        Ok((feed, channels))
    }

    pub fn config(&self) -> &FlickConfig {
        &self.config
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    pub fn videos(&self) -> &[VideoItem] {
        &self.videos
    }

    pub fn current_index(&self) -> Option<usize> {
        self.pool.current_index()
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub fn scheduler(&self) -> &PreloadScheduler {
        &self.scheduler
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkInfo> {
        self.network.subscribe()
    }

    pub fn subscribe_power(&self) -> watch::Receiver<PowerInfo> {
        self.power.subscribe()
    }

    /// The user settled on `index` of `videos`
    #[instrument(skip(self, videos), fields(videos = videos.len()))]
    pub async fn on_index_change(&mut self, index: usize, videos: Vec<VideoItem>) -> Result<PoolUpdate> {
        // A rejected change must leave the current list and bindings alone
        if !videos.is_empty() && index >= videos.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: videos.len(),
            });
        }
        self.videos = videos;
        self.move_to(index).await
    }

    /// Forward a gesture intent to the current controller
    pub async fn handle_intent(&mut self, intent: Intent) -> Result<Option<PlayOutcome>> {
        debug!(?intent, "Intent");
        match intent {
            Intent::Next | Intent::Prev => {
                let Some(current) = self.pool.current_index() else {
                    return Ok(None);
                };
                let target = match intent {
                    Intent::Next => current.checked_add(1).filter(|i| *i < self.videos.len()),
                    _ => current.checked_sub(1),
                };
                match target {
                    Some(index) => {
                        self.move_to(index).await?;
                    }
                    None => debug!(current, "Already at the edge of the feed"),
                }
                return Ok(None);
            }
            _ => {}
        }

        let Some(controller) = self.pool.current_controller_mut() else {
            return Ok(matches!(intent, Intent::Play | Intent::TogglePlay).then_some(PlayOutcome::NoSession));
        };

        let outcome = match intent {
            Intent::TogglePlay => controller.toggle_play().await,
            Intent::Play => Some(controller.play().await),
            Intent::Pause => {
                controller.pause()?;
                None
            }
            Intent::Seek { position } => {
                controller.seek(position)?;
                None
            }
            Intent::Retry => {
                controller.retry()?;
                Some(controller.autoplay().await)
            }
            Intent::SetVolume { volume } => {
                controller.set_volume(volume)?;
                None
            }
            Intent::ToggleMute => {
                controller.toggle_mute()?;
                None
            }
            Intent::SetQuality { selection } => {
                controller.set_quality(selection)?;
                None
            }
            Intent::SetRate { rate } => {
                controller.set_playback_rate(rate)?;
                None
            }
            Intent::Next | Intent::Prev => None,
        };
        Ok(outcome)
    }

    pub async fn handle_surface_event(&mut self, event: SurfaceEvent) -> Result<()> {
        self.pool.handle_surface_event(event).await
    }

    pub async fn handle_engine_task(&mut self, result: EngineTaskResult) -> Result<()> {
        self.pool.handle_engine_task(result).await
    }

    /// Apply a preload result; successful transfers feed the preload
    /// bandwidth estimate
    pub fn handle_fetch_completion(&mut self, completion: FetchCompletion) -> Option<TransferSample> {
        let sample = self.scheduler.handle_completion(completion)?;
        self.preload_bandwidth.record(sample);
        Some(sample)
    }

    pub async fn apply_network_sample(&mut self, sample: Option<NetworkSample>) {
        if self.network.update(sample) {
            self.apply_network().await;
        }
    }

    pub async fn apply_power_sample(&mut self, sample: Option<PowerSample>) {
        if self.power.update(sample) {
            self.apply_power().await;
        }
    }

    /// Poll the platform probes
    pub async fn refresh_monitors(&mut self) {
        if self.network.refresh() {
            self.apply_network().await;
        }
        if self.power.refresh() {
            self.apply_power().await;
        }
    }

    pub fn on_scroll_velocity(&mut self, velocity: f64) {
        self.scheduler.handle_scroll_velocity(velocity);
    }

    pub fn set_preload_paused(&mut self, paused: bool) {
        self.scheduler.set_paused(paused);
    }

    pub fn poll_timers(&mut self, now: Instant) {
        self.pool.poll_timers(now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pool.next_deadline()
    }

    /// Periodic forced cleanup; returns the number of disposals
    pub fn sweep_memory(&mut self) -> usize {
        let orders = self.governor.sweep();
        if !orders.is_empty() {
            self.pool.apply_disposal(&orders, &mut self.governor);
        }
        orders.len()
    }

    /// Snapshot of the session at the current index
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.current_controller().and_then(|c| c.snapshot())
    }

    pub fn analytics(&self) -> Option<AnalyticsSnapshot> {
        self.current_controller().and_then(|c| c.analytics_snapshot())
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            current_index: self.pool.current_index(),
            video_count: self.videos.len(),
            engine: self.engine_kind,
            slots: self.pool.slots_info(),
            memory: self.governor.stats(),
            preload: self.scheduler.stats(),
            preload_bandwidth_bps: self.preload_bandwidth.estimate(),
            network: self.network.info().clone(),
            power: self.power.info().clone(),
        }
    }

    /// Detach everything and abandon pending preloads
    pub fn shutdown(&mut self) -> Vec<AnalyticsSnapshot> {
        let snapshots = self.pool.release_all(&mut self.governor);
        self.scheduler.clear();
        info!(sessions = snapshots.len(), "Feed shut down");
        snapshots
    }

    async fn move_to(&mut self, index: usize) -> Result<PoolUpdate> {
        if self.videos.is_empty() {
            self.shutdown();
            return Ok(PoolUpdate::default());
        }
        let update = self
            .pool
            .on_index_change(index, &self.videos, &mut self.scheduler, &mut self.governor)?;

        let orders = self.governor.get_videos_to_dispose();
        if !orders.is_empty() {
            self.pool.apply_disposal(&orders, &mut self.governor);
        }

        let outcome = self.pool.activate().await;
        debug!(index, ?outcome, "Activated current video");
        Ok(update)
    }

    async fn apply_network(&mut self) {
        let info = self.network.info().clone();
        let recommendation = self.network.recommendation();
        info!(class = %info.class, "Connection class changed");
        self.scheduler
            .set_pause_reason(PauseReason::Network, recommendation.pause_preloading);
        self.pool.apply_network(&info, &recommendation).await;
    }

    async fn apply_power(&mut self) {
        let info = self.power.info().clone();
        info!(power_saving = info.power_saving, level = ?info.level, "Power state changed");
        self.scheduler.set_pause_reason(PauseReason::Power, info.power_saving);
        self.pool.apply_power(&info).await;
    }

    fn current_controller(&self) -> Option<&crate::controller::PlaybackController> {
        let index = self.pool.current_index()?;
        let slot = self.pool.slot_for_index(index)?;
        self.pool.controller(slot)
    }
}
