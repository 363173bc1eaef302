//! Playback session - transport state of one attached video

use crate::types::*;
use serde::{Deserialize, Serialize};

/// Gap tolerated between two ranges that still count as contiguous
const CONTIGUITY_TOLERANCE: f64 = 0.1;

/// Transport state of a single attached video.
///
/// Created when a controller attaches a video, dropped on detach; only its
/// controller mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSession {
    pub id: SessionId,
    pub video_id: VideoId,
    pub state: PlayerState,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub buffered_ranges: Vec<TimeRange>,
    pub quality_levels: Vec<QualityLevel>,
    pub current_quality_index: Option<usize>,
    pub quality_selection: QualitySelection,
    pub playback_rate: f64,
    pub volume: f64,
    pub muted: bool,
    pub bandwidth_estimate: u64,
    /// Playback has reached `Playing` at least once
    pub started: bool,
}

impl PlaybackSession {
    pub fn new(video: &VideoItem) -> Self {
        Self {
            id: SessionId::new(),
            video_id: video.id.clone(),
            state: PlayerState::Idle,
            current_time: 0.0,
            duration: video.duration_hint,
            buffered_ranges: Vec::new(),
            quality_levels: Vec::new(),
            current_quality_index: None,
            quality_selection: QualitySelection::Auto,
            playback_rate: 1.0,
            volume: 1.0,
            muted: false,
            bandwidth_estimate: 0,
            started: false,
        }
    }

    /// Clamp a seek target into `[0, duration]`
    pub fn clamp_position(&self, position: f64) -> f64 {
        let position = if position.is_finite() { position } else { 0.0 };
        match self.duration {
            Some(duration) => position.clamp(0.0, duration.max(0.0)),
            None => position.max(0.0),
        }
    }

    /// Seconds of contiguous buffer ahead of the play cursor
    pub fn buffered_ahead(&self) -> f64 {
        let mut ranges = self.buffered_ranges.clone();
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

        let cursor = self.current_time;
        let mut end: Option<f64> = None;

        for range in ranges {
            match end {
                None => {
                    if range.start - CONTIGUITY_TOLERANCE <= cursor && range.end >= cursor {
                        end = Some(range.end);
                    }
                }
                Some(current_end) => {
                    if range.start - current_end <= CONTIGUITY_TOLERANCE {
                        end = Some(current_end.max(range.end));
                    } else {
                        break;
                    }
                }
            }
        }

        end.map(|e| (e - cursor).max(0.0)).unwrap_or(0.0)
    }

    /// Snapshot for the UI layer
    pub fn snapshot(&self) -> SessionSnapshot {
        let quality = self
            .current_quality_index
            .and_then(|i| self.quality_levels.get(i))
            .cloned();

        SessionSnapshot {
            session_id: self.id,
            video_id: self.video_id.clone(),
            state: self.state,
            current_time: self.current_time,
            duration: self.duration,
            buffered_ranges: self.buffered_ranges.clone(),
            buffered_ahead: self.buffered_ahead(),
            quality,
            is_auto: self.quality_selection.is_auto(),
            volume: self.volume,
            muted: self.muted,
            playback_rate: self.playback_rate,
        }
    }
}

/// What the feed item UI needs to draw progress bars and spinners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub state: PlayerState,
    pub current_time: f64,
    pub duration: Option<f64>,
    pub buffered_ranges: Vec<TimeRange>,
    pub buffered_ahead: f64,
    pub quality: Option<QualityLevel>,
    pub is_auto: bool,
    pub volume: f64,
    pub muted: bool,
    pub playback_rate: f64,
}
