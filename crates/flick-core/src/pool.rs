//! Engine pool
//!
//! A fixed set of playback slots mapped onto the feed around the current
//! index. Slots and their render surfaces are reused across videos; only
//! the binding changes. The pool is the only place that mutates
//! slot-to-index bindings.
//!
//! Tiers by distance `d = index - current`:
//!
//! | d                 | tier    | resource class |
//! |-------------------|---------|----------------|
//! | -1, 0, 1          | high    | full           |
//! | 2                 | medium  | partial        |
//! | 3                 | low     | metadata       |
//! | 3 < \|d\| <= N/2  | retain  | metadata, no slot |
//! | otherwise         | release | none           |

use crate::analytics::AnalyticsSnapshot;
use crate::config::PoolConfig;
use crate::controller::{ControllerOptions, PlaybackController};
use crate::engine::{EngineTaskResult, SurfaceEvent, SurfaceFactory};
use crate::events::PlayOutcome;
use crate::memory::{DisposeAction, DisposeOrder, MemoryGovernor};
use crate::network::{BufferRecommendation, NetworkInfo};
use crate::power::PowerInfo;
use crate::preload::PreloadScheduler;
use crate::types::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Preload tier of a feed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPriority {
    High,
    Medium,
    Low,
    /// Metadata kept warm without a slot
    Retain,
    Release,
}

impl PreloadPriority {
    pub fn resource_class(self) -> Option<ResourceClass> {
        match self {
            PreloadPriority::High => Some(ResourceClass::Full),
            PreloadPriority::Medium => Some(ResourceClass::Partial),
            PreloadPriority::Low | PreloadPriority::Retain => Some(ResourceClass::Metadata),
            PreloadPriority::Release => None,
        }
    }

    /// Whether the position is bound to an engine slot
    pub fn wants_slot(self) -> bool {
        matches!(self, PreloadPriority::High | PreloadPriority::Medium | PreloadPriority::Low)
    }

    /// Scheduler priority; nearer retained positions rank higher
    pub fn scheduler_priority(self, distance: i64) -> i32 {
        match self {
            PreloadPriority::High => 90,
            PreloadPriority::Medium => 60,
            PreloadPriority::Low => 30,
            PreloadPriority::Retain => 10 - distance.unsigned_abs().min(10) as i32,
            PreloadPriority::Release => 0,
        }
    }
}

impl std::fmt::Display for PreloadPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreloadPriority::High => write!(f, "high"),
            PreloadPriority::Medium => write!(f, "medium"),
            PreloadPriority::Low => write!(f, "low"),
            PreloadPriority::Retain => write!(f, "retain"),
            PreloadPriority::Release => write!(f, "release"),
        }
    }
}

/// Tier of feed position `index` while the user is at `current`
pub fn preload_priority(index: usize, current: usize, window: usize) -> PreloadPriority {
    let d = index as i64 - current as i64;
    let half = (window / 2) as i64;
    match d {
        -1..=1 => PreloadPriority::High,
        2 => PreloadPriority::Medium,
        3 => PreloadPriority::Low,
        _ if d.abs() > 3 && d.abs() <= half => PreloadPriority::Retain,
        _ => PreloadPriority::Release,
    }
}

/// A reusable slot and the feed position it represents
pub struct EngineSlot {
    id: SlotId,
    index: Option<usize>,
    tier: Option<PreloadPriority>,
    controller: PlaybackController,
}

impl EngineSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn tier(&self) -> Option<PreloadPriority> {
        self.tier
    }

    pub fn state(&self) -> SlotState {
        self.controller.slot_state()
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    fn video_id(&self) -> Option<&VideoId> {
        self.controller.video().map(|v| &v.id)
    }

    fn unbind(&mut self) -> Option<AnalyticsSnapshot> {
        self.index = None;
        self.tier = None;
        self.controller.detach()
    }
}

/// Per-slot diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot: SlotId,
    pub index: Option<usize>,
    pub video_id: Option<VideoId>,
    pub state: SlotState,
    pub player_state: PlayerState,
    pub tier: Option<PreloadPriority>,
}

/// Binding changes of one recomputation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolUpdate {
    pub attached: Vec<(SlotId, usize)>,
    pub released: Vec<SlotId>,
    pub kept: usize,
    pub analytics: Vec<AnalyticsSnapshot>,
}

pub struct EnginePool {
    config: PoolConfig,
    slots: Vec<EngineSlot>,
    current: Option<usize>,
    /// Videos this pool registered with the memory governor
    mounted: HashSet<VideoId>,
}

impl EnginePool {
    pub fn new(
        config: PoolConfig,
        surfaces: &dyn SurfaceFactory,
        surface_events: mpsc::UnboundedSender<SurfaceEvent>,
        options: ControllerOptions,
    ) -> Self {
        let slots = (0..config.slot_count.max(1))
            .map(|i| {
                let id = SlotId(i);
                let surface = surfaces.create(id, surface_events.clone());
                EngineSlot {
                    id,
                    index: None,
                    tier: None,
                    controller: PlaybackController::new(id, surface, options.clone()),
                }
            })
            .collect();

        Self {
            config,
            slots,
            current: None,
            mounted: HashSet::new(),
        }
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn slots(&self) -> &[EngineSlot] {
        &self.slots
    }

    pub fn slot_for_index(&self, index: usize) -> Option<SlotId> {
        self.slots.iter().find(|s| s.index == Some(index)).map(|s| s.id)
    }

    pub fn controller(&self, slot: SlotId) -> Option<&PlaybackController> {
        self.slots.get(slot.0).map(|s| &s.controller)
    }

    pub fn controller_mut(&mut self, slot: SlotId) -> Option<&mut PlaybackController> {
        self.slots.get_mut(slot.0).map(|s| &mut s.controller)
    }

    /// Controller bound to the current index
    pub fn current_controller_mut(&mut self) -> Option<&mut PlaybackController> {
        let current = self.current?;
        self.slots
            .iter_mut()
            .find(|s| s.index == Some(current))
            .map(|s| &mut s.controller)
    }

    /// Recompute bindings for a new current index and forward resource
    /// requests to the scheduler and residency to the governor
    #[instrument(skip(self, videos, scheduler, governor), fields(videos = videos.len()))]
    pub fn on_index_change(
        &mut self,
        index: usize,
        videos: &[VideoItem],
        scheduler: &mut PreloadScheduler,
        governor: &mut MemoryGovernor,
    ) -> Result<PoolUpdate> {
        if index >= videos.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: videos.len(),
            });
        }
        let window = self.config.window;

        let mut desired: Vec<(usize, PreloadPriority)> = (0..videos.len())
            .map(|i| (i, preload_priority(i, index, window)))
            .filter(|(_, tier)| tier.wants_slot())
            .collect();
        desired.sort_by_key(|(i, tier)| {
            let d = *i as i64 - index as i64;
            (*tier, d.abs(), d < 0)
        });
        desired.truncate(self.slots.len());
        let wanted: HashMap<usize, PreloadPriority> = desired.iter().copied().collect();

        let mut update = PoolUpdate::default();
        let mut free: Vec<usize> = Vec::new();
        let mut served: HashSet<usize> = HashSet::new();

        for (pos, slot) in self.slots.iter().enumerate() {
            let keep = match slot.index {
                Some(i) => {
                    wanted.contains_key(&i) && videos.get(i).map(|v| &v.id) == slot.video_id()
                }
                None => false,
            };
            if keep {
                served.insert(slot.index.unwrap_or_default());
                update.kept += 1;
            } else {
                free.push(pos);
            }
        }

        for (i, tier) in &desired {
            if served.contains(i) {
                continue;
            }
            // Reuse the free slot furthest from the new position; empty first
            let Some(choice) = free
                .iter()
                .enumerate()
                .max_by_key(|&(_, &pos)| {
                    let distance = match self.slots[pos].index {
                        Some(bound) => (bound as i64 - index as i64).unsigned_abs(),
                        None => u64::MAX,
                    };
                    (distance, std::cmp::Reverse(pos))
                })
                .map(|(k, _)| k)
            else {
                break;
            };
            let pos = free.swap_remove(choice);
            let slot = &mut self.slots[pos];

            if let Some(snapshot) = slot.unbind() {
                update.analytics.push(snapshot);
            }
            let class = tier.resource_class().unwrap_or(ResourceClass::Metadata);
            slot.controller.attach(&videos[*i], class)?;
            slot.index = Some(*i);
            slot.tier = Some(*tier);
            served.insert(*i);
            update.attached.push((slot.id, *i));
            debug!(slot = %slot.id, index = i, %tier, "Slot bound");
        }

        for pos in free {
            let slot = &mut self.slots[pos];
            if slot.index.is_none() && slot.controller.video().is_none() {
                continue;
            }
            if let Some(snapshot) = slot.unbind() {
                update.analytics.push(snapshot);
            }
            update.released.push(slot.id);
            debug!(slot = %slot.id, "Slot released");
        }

        // Newly bound or promoted slots decode; the rest keep what the
        // governor last decided for them
        let mut promoted: HashSet<SlotId> = update
            .attached
            .iter()
            .filter(|(_, i)| wanted.get(i) == Some(&PreloadPriority::High))
            .map(|(id, _)| *id)
            .collect();
        for slot in &mut self.slots {
            if let Some(tier) = slot.index.and_then(|i| wanted.get(&i)).copied() {
                if slot.tier == Some(tier) {
                    continue;
                }
                if tier == PreloadPriority::High {
                    promoted.insert(slot.id);
                }
                slot.tier = Some(tier);
                if let Some(class) = tier.resource_class() {
                    slot.controller.set_resource_class(class);
                }
            }
        }

        self.current = Some(index);
        self.sync_governor(governor, &promoted);
        if let Some(video) = videos.get(index) {
            governor.touch(&video.id);
        }
        self.forward_preloads(index, videos, scheduler);

        info!(
            index,
            kept = update.kept,
            attached = update.attached.len(),
            released = update.released.len(),
            "Pool recomputed"
        );
        Ok(update)
    }

    /// Pause every other slot and start the current one
    pub async fn activate(&mut self) -> PlayOutcome {
        let Some(current) = self.current else {
            return PlayOutcome::NoSession;
        };
        for slot in self.slots.iter_mut().filter(|s| s.index != Some(current)) {
            if matches!(slot.controller.slot_state(), SlotState::Active) {
                if let Err(e) = slot.controller.pause() {
                    warn!(slot = %slot.id, error = %e, "Could not pause inactive slot");
                }
            }
        }
        match self.current_controller_mut() {
            Some(controller) => controller.autoplay().await,
            None => PlayOutcome::NoSession,
        }
    }

    /// Carry out governor decisions for the videos this pool holds
    pub fn apply_disposal(&mut self, orders: &[DisposeOrder], governor: &mut MemoryGovernor) -> Vec<AnalyticsSnapshot> {
        let mut snapshots = Vec::new();
        for order in orders {
            let slot = self
                .slots
                .iter_mut()
                .find(|s| s.video_id() == Some(&order.video_id));

            match order.action {
                DisposeAction::Unmount => {
                    if let Some(slot) = slot {
                        info!(slot = %slot.id, video = %order.video_id, "Unmounting under memory pressure");
                        if let Some(snapshot) = slot.unbind() {
                            snapshots.push(snapshot);
                        }
                    }
                    self.mounted.remove(&order.video_id);
                    governor.set_in_surface(&order.video_id, false);
                }
                DisposeAction::ReleaseDecoded => {
                    let released = match slot {
                        Some(slot) => match slot.controller.suspend() {
                            Ok(()) => {
                                debug!(slot = %slot.id, video = %order.video_id, "Releasing decoded frames");
                                slot.controller.set_resource_class(ResourceClass::Metadata);
                                true
                            }
                            Err(e) => {
                                warn!(
                                    slot = %slot.id,
                                    video = %order.video_id,
                                    error = %e,
                                    "Could not release decoded frames"
                                );
                                false
                            }
                        },
                        None => true,
                    };
                    if released {
                        governor.set_decoded(&order.video_id, false);
                    }
                }
            }
        }
        snapshots
    }

    pub async fn apply_network(&mut self, info: &NetworkInfo, recommendation: &BufferRecommendation) {
        for slot in &mut self.slots {
            slot.controller.apply_network(info, recommendation).await;
        }
    }

    pub async fn apply_power(&mut self, info: &PowerInfo) {
        for slot in &mut self.slots {
            slot.controller.apply_power(info).await;
        }
    }

    pub async fn handle_surface_event(&mut self, event: SurfaceEvent) -> Result<()> {
        let controller = self.controller_mut(event.slot).ok_or(Error::UnknownSlot(event.slot))?;
        controller.handle_media_event(event.event).await;
        Ok(())
    }

    pub async fn handle_engine_task(&mut self, result: EngineTaskResult) -> Result<()> {
        let controller = self.controller_mut(result.slot).ok_or(Error::UnknownSlot(result.slot))?;
        controller.handle_engine_task(result).await;
        Ok(())
    }

    pub fn poll_timers(&mut self, now: Instant) {
        for slot in &mut self.slots {
            slot.controller.poll_timers(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(|s| s.controller.next_deadline()).min()
    }

    pub fn slots_info(&self) -> Vec<SlotInfo> {
        self.slots
            .iter()
            .map(|s| SlotInfo {
                slot: s.id,
                index: s.index,
                video_id: s.video_id().cloned(),
                state: s.state(),
                player_state: s.controller.state(),
                tier: s.tier,
            })
            .collect()
    }

    /// Unbind every slot
    pub fn release_all(&mut self, governor: &mut MemoryGovernor) -> Vec<AnalyticsSnapshot> {
        let snapshots = self.slots.iter_mut().filter_map(|s| s.unbind()).collect();
        for id in self.mounted.drain() {
            governor.unregister(&id);
        }
        self.current = None;
        snapshots
    }

    /// Bound slots are resident; only the high tier keeps decoded frames,
    /// and a governor release sticks until the slot is bound or promoted again
    fn sync_governor(&mut self, governor: &mut MemoryGovernor, promoted: &HashSet<SlotId>) {
        let mut bound = HashSet::new();
        for slot in &self.slots {
            let Some(video_id) = slot.video_id() else {
                continue;
            };
            governor.register(video_id.clone());
            if slot.tier != Some(PreloadPriority::High) {
                governor.set_decoded(video_id, false);
            } else if promoted.contains(&slot.id) {
                governor.set_decoded(video_id, true);
            }
            bound.insert(video_id.clone());
        }
        for stale in self.mounted.difference(&bound) {
            governor.unregister(stale);
        }
        self.mounted = bound;
    }

    fn forward_preloads(&self, index: usize, videos: &[VideoItem], scheduler: &mut PreloadScheduler) {
        let mut relevant: HashSet<Url> = HashSet::new();
        for (i, video) in videos.iter().enumerate() {
            let tier = preload_priority(i, index, self.config.window);
            let Some(class) = tier.resource_class() else {
                continue;
            };
            relevant.insert(video.url.clone());
            if i == index {
                continue;
            }
            let d = i as i64 - index as i64;
            scheduler.enqueue(video.url.clone(), tier.scheduler_priority(d), class);
        }
        scheduler.retain_relevant(&relevant);
    }
}
