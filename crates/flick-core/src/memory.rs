//! Memory governance
//!
//! Tracks which videos have a mounted render surface and which hold decoded
//! frames, keeps an aggregate size estimate, and decides what to dispose
//! when the residency or decoded-frame caps are exceeded. Decisions are
//! least-recently-accessed first; the caller owning the surfaces carries
//! them out and reports back.

use crate::config::MemoryConfig;
use crate::types::VideoId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tracked residency of one video
#[derive(Debug, Clone, PartialEq)]
pub struct ResidencyEntry {
    pub video_id: VideoId,
    /// Mounted in a render surface
    pub in_render_surface: bool,
    /// Holding decoded frames (not just a thumbnail)
    pub has_decoded_frames: bool,
    pub estimated_size_mb: f64,
    pub last_accessed: Instant,
    /// Tie-break for accesses within the same instant
    access_seq: u64,
}

/// What a caller should do with a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposeAction {
    /// Drop decoded frames, keep the surface showing a thumbnail
    ReleaseDecoded,
    /// Drop the video from the render surface entirely
    Unmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisposeOrder {
    pub video_id: VideoId,
    pub action: DisposeAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub tracked: usize,
    pub resident: usize,
    pub decoded: usize,
    pub total_estimated_mb: f64,
    pub ceiling_mb: f64,
    pub low_memory: bool,
}

/// Owner of eviction decisions; one per feed
pub struct MemoryGovernor {
    config: MemoryConfig,
    entries: HashMap<VideoId, ResidencyEntry>,
    total_mb: f64,
    low_memory: bool,
    next_seq: u64,
}

impl MemoryGovernor {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            total_mb: 0.0,
            low_memory: false,
            next_seq: 0,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Start tracking a mounted video
    pub fn register(&mut self, video_id: VideoId) {
        let seq = self.bump_seq();
        let surface_mb = self.config.surface_estimate_mb;
        self.entries
            .entry(video_id.clone())
            .and_modify(|entry| {
                entry.in_render_surface = true;
                entry.last_accessed = Instant::now();
                entry.access_seq = seq;
            })
            .or_insert_with(|| ResidencyEntry {
                video_id,
                in_render_surface: true,
                has_decoded_frames: false,
                estimated_size_mb: surface_mb,
                last_accessed: Instant::now(),
                access_seq: seq,
            });
        self.recompute();
    }

    /// Stop tracking a video; true if it was tracked
    pub fn unregister(&mut self, video_id: &VideoId) -> bool {
        let removed = self.entries.remove(video_id).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    /// Mount or unmount; unmounting also drops decoded frames
    pub fn set_in_surface(&mut self, video_id: &VideoId, mounted: bool) {
        let Some(entry) = self.entries.get_mut(video_id) else {
            return;
        };
        entry.in_render_surface = mounted;
        if !mounted {
            entry.has_decoded_frames = false;
        }
        self.recompute();
    }

    /// Decoded frames imply a mounted surface
    pub fn set_decoded(&mut self, video_id: &VideoId, decoded: bool) {
        let Some(entry) = self.entries.get_mut(video_id) else {
            return;
        };
        entry.has_decoded_frames = decoded;
        if decoded {
            entry.in_render_surface = true;
        }
        self.recompute();
    }

    pub fn touch(&mut self, video_id: &VideoId) {
        let seq = self.bump_seq();
        if let Some(entry) = self.entries.get_mut(video_id) {
            entry.last_accessed = Instant::now();
            entry.access_seq = seq;
        }
    }

    pub fn residency(&self, video_id: &VideoId) -> Option<&ResidencyEntry> {
        self.entries.get(video_id)
    }

    pub fn is_resident(&self, video_id: &VideoId) -> bool {
        self.entries.get(video_id).is_some_and(|e| e.in_render_surface)
    }

    pub fn has_decoded(&self, video_id: &VideoId) -> bool {
        self.entries.get(video_id).is_some_and(|e| e.has_decoded_frames)
    }

    pub fn total_estimated_mb(&self) -> f64 {
        self.total_mb
    }

    pub fn is_low_memory(&self) -> bool {
        self.low_memory
    }

    /// Least-recently-accessed videos needed to get back under both caps.
    ///
    /// The residency cap is satisfied first; unmounting also frees decoded
    /// frames, so the decoded cap is evaluated over what stays mounted.
    pub fn get_videos_to_dispose(&self) -> Vec<DisposeOrder> {
        let by_age = self.oldest_first();
        let mut orders = Vec::new();

        let resident: Vec<&ResidencyEntry> = by_age.iter().copied().filter(|e| e.in_render_surface).collect();
        let excess = resident.len().saturating_sub(self.config.max_resident);
        let unmounted: HashSet<&VideoId> = resident.iter().take(excess).map(|e| &e.video_id).collect();
        orders.extend(resident.iter().take(excess).map(|e| DisposeOrder {
            video_id: e.video_id.clone(),
            action: DisposeAction::Unmount,
        }));

        let decoded: Vec<&ResidencyEntry> = by_age
            .iter()
            .copied()
            .filter(|e| e.has_decoded_frames && !unmounted.contains(&e.video_id))
            .collect();
        let excess = decoded.len().saturating_sub(self.config.max_decoded);
        orders.extend(decoded.iter().take(excess).map(|e| DisposeOrder {
            video_id: e.video_id.clone(),
            action: DisposeAction::ReleaseDecoded,
        }));

        orders
    }

    /// Periodic cleanup: regular cap eviction, then forced release while
    /// the estimate stays above the ceiling. The most recently accessed
    /// video is spared.
    pub fn sweep(&self) -> Vec<DisposeOrder> {
        let mut orders = self.get_videos_to_dispose();
        let mut projected: HashMap<&VideoId, (bool, bool)> = self
            .entries
            .values()
            .map(|e| (&e.video_id, (e.in_render_surface, e.has_decoded_frames)))
            .collect();
        for order in &orders {
            if let Some(flags) = projected.get_mut(&order.video_id) {
                *flags = match order.action {
                    DisposeAction::Unmount => (false, false),
                    DisposeAction::ReleaseDecoded => (flags.0, false),
                };
            }
        }

        let mut total: f64 = projected.values().map(|(s, d)| self.estimate(*s, *d)).sum();
        if total <= self.config.ceiling_mb {
            return orders;
        }

        let by_age = self.oldest_first();
        let candidates = &by_age[..by_age.len().saturating_sub(1)];

        for entry in candidates {
            if total <= self.config.ceiling_mb {
                break;
            }
            let Some(flags) = projected.get_mut(&entry.video_id) else {
                continue;
            };
            if flags.1 {
                total -= self.estimate(flags.0, true) - self.estimate(flags.0, false);
                flags.1 = false;
                orders.push(DisposeOrder {
                    video_id: entry.video_id.clone(),
                    action: DisposeAction::ReleaseDecoded,
                });
            }
        }
        for entry in candidates {
            if total <= self.config.ceiling_mb {
                break;
            }
            let Some(flags) = projected.get_mut(&entry.video_id) else {
                continue;
            };
            if flags.0 {
                total -= self.estimate(true, false);
                *flags = (false, false);
                orders.retain(|o| o.video_id != entry.video_id);
                orders.push(DisposeOrder {
                    video_id: entry.video_id.clone(),
                    action: DisposeAction::Unmount,
                });
            }
        }

        if total > self.config.ceiling_mb {
            warn!(projected_mb = total, ceiling_mb = self.config.ceiling_mb, "Still over budget after sweep");
        } else {
            info!(orders = orders.len(), projected_mb = total, "Forced memory cleanup");
        }
        orders
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            tracked: self.entries.len(),
            resident: self.entries.values().filter(|e| e.in_render_surface).count(),
            decoded: self.entries.values().filter(|e| e.has_decoded_frames).count(),
            total_estimated_mb: self.total_mb,
            ceiling_mb: self.config.ceiling_mb,
            low_memory: self.low_memory,
        }
    }

    fn oldest_first(&self) -> Vec<&ResidencyEntry> {
        let mut entries: Vec<&ResidencyEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.last_accessed, e.access_seq));
        entries
    }

    fn estimate(&self, in_surface: bool, decoded: bool) -> f64 {
        match (in_surface, decoded) {
            (_, true) => self.config.decoded_estimate_mb,
            (true, false) => self.config.surface_estimate_mb,
            (false, false) => 0.0,
        }
    }

    fn recompute(&mut self) {
        let (decoded_mb, surface_mb) = (self.config.decoded_estimate_mb, self.config.surface_estimate_mb);
        for entry in self.entries.values_mut() {
            entry.estimated_size_mb = match (entry.in_render_surface, entry.has_decoded_frames) {
                (_, true) => decoded_mb,
                (true, false) => surface_mb,
                (false, false) => 0.0,
            };
        }
        self.total_mb = self.entries.values().map(|e| e.estimated_size_mb).sum();

        let low = self.total_mb > self.config.ceiling_mb;
        if low != self.low_memory {
            if low {
                warn!(total_mb = self.total_mb, ceiling_mb = self.config.ceiling_mb, "Memory ceiling exceeded");
            } else {
                debug!(total_mb = self.total_mb, "Memory back under ceiling");
            }
            self.low_memory = low;
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> VideoId {
        VideoId::new(format!("v{n}"))
    }

    fn governor(max_resident: usize, max_decoded: usize) -> MemoryGovernor {
        MemoryGovernor::new(MemoryConfig {
            max_resident,
            max_decoded,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_caps_disposes_nothing() {
        let mut g = governor(5, 3);
        for n in 0..3 {
            g.register(id(n));
            g.set_decoded(&id(n), true);
        }
        assert!(g.get_videos_to_dispose().is_empty());
        assert_eq!(g.total_estimated_mb(), 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decoded_cap_releases_oldest_only() {
        let mut g = governor(5, 2);
        for n in 0..4 {
            g.register(id(n));
            g.set_decoded(&id(n), true);
            tokio::time::advance(std::time::Duration::from_millis(10)).await;
        }
        g.touch(&id(0));

        let orders = g.get_videos_to_dispose();
        assert_eq!(
            orders,
            vec![
                DisposeOrder { video_id: id(1), action: DisposeAction::ReleaseDecoded },
                DisposeOrder { video_id: id(2), action: DisposeAction::ReleaseDecoded },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caps_are_satisfied_independently() {
        let mut g = governor(2, 1);
        g.register(id(0));
        g.set_decoded(&id(0), true);
        g.register(id(1));
        g.set_decoded(&id(1), true);
        g.register(id(2));
        g.set_decoded(&id(2), true);

        // Unmounting v0 fixes residency; v1 still has to give up frames
        let orders = g.get_videos_to_dispose();
        assert_eq!(
            orders,
            vec![
                DisposeOrder { video_id: id(0), action: DisposeAction::Unmount },
                DisposeOrder { video_id: id(1), action: DisposeAction::ReleaseDecoded },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_memory_flag() {
        let mut g = MemoryGovernor::new(MemoryConfig {
            ceiling_mb: 50.0,
            ..Default::default()
        });
        g.register(id(0));
        g.set_decoded(&id(0), true);
        assert!(!g.is_low_memory());
        g.register(id(1));
        g.set_decoded(&id(1), true);
        assert!(g.is_low_memory());

        g.set_in_surface(&id(1), false);
        assert!(!g.is_low_memory());
        assert!(!g.has_decoded(&id(1)));
        assert!(!g.is_resident(&id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_forces_release_over_ceiling() {
        let mut g = MemoryGovernor::new(MemoryConfig {
            ceiling_mb: 50.0,
            ..Default::default()
        });
        for n in 0..3 {
            g.register(id(n));
            g.set_decoded(&id(n), true);
            tokio::time::advance(std::time::Duration::from_millis(10)).await;
        }
        assert!(g.get_videos_to_dispose().is_empty());

        let orders = g.sweep();
        assert_eq!(
            orders,
            vec![
                DisposeOrder { video_id: id(0), action: DisposeAction::ReleaseDecoded },
                DisposeOrder { video_id: id(1), action: DisposeAction::ReleaseDecoded },
            ]
        );
    }

    #[test]
    fn test_untracked_is_not_resident() {
        let g = governor(5, 3);
        assert!(!g.is_resident(&id(9)));
        assert!(g.residency(&id(9)).is_none());
    }
}
