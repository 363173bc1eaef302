//! Analytics event emission
//!
//! Captures per-session playback events for:
//! - Startup time and rebuffering (QoE)
//! - Quality switches
//! - Error tracking
//! - Seek behaviour

use crate::error::StreamError;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Channel that receives analytics records
pub type AnalyticsSink = mpsc::UnboundedSender<AnalyticsEventRecord>;

/// Analytics event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// Video attached to an engine
    Load {
        url: String,
    },

    /// First frame rendered
    Startup {
        startup_time_ms: u64,
    },

    /// Seek performed
    Seek {
        from: f64,
        to: f64,
    },

    /// Rebuffering started
    Rebuffer {
        position: f64,
    },

    /// Rebuffering ended
    RebufferEnd {
        position: f64,
        duration_ms: u64,
    },

    /// Quality change
    QualityChange {
        from: Option<usize>,
        to: Option<usize>,
        bitrate_bps: u64,
        reason: QualityChangeReason,
    },

    /// State change
    StateChange {
        from: PlayerState,
        to: PlayerState,
        position: f64,
    },

    /// Error occurred
    Error {
        code: String,
        message: String,
        fatal: bool,
        position: f64,
    },

    /// Session finished
    End {
        position: f64,
        watch_time_ms: u64,
    },
}

/// Reason for quality change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityChangeReason {
    /// Engine ABR decision
    Abr,
    /// User manual selection
    Manual,
    /// Forced by a constrained network
    Network,
}

/// Analytics event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEventRecord {
    /// Unique event ID
    pub id: Uuid,
    /// Session ID
    pub session_id: SessionId,
    /// Video the session plays
    pub video_id: VideoId,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Sequence number
    pub sequence: u64,
    /// The event
    #[serde(flatten)]
    pub event: AnalyticsEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySwitch {
    /// Milliseconds since the session was attached
    pub at_ms: u64,
    pub from: Option<usize>,
    pub to: Option<usize>,
    pub bitrate_bps: u64,
    pub reason: QualityChangeReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at_ms: u64,
    pub code: String,
    pub message: String,
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeekRecord {
    pub at_ms: u64,
    pub from: f64,
    pub to: f64,
}

/// Per-session analytics, finalized when the session ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub startup_time_ms: Option<u64>,
    pub total_buffering_time_ms: u64,
    pub buffering_count: u32,
    pub quality_switches: Vec<QualitySwitch>,
    pub errors: Vec<ErrorRecord>,
    pub seeks: Vec<SeekRecord>,
    pub watch_time_ms: u64,
    pub qoe_score: f64,
    pub finalized: bool,
}

/// Tracks one playback session
#[derive(Debug)]
pub struct AnalyticsTracker {
    session_id: SessionId,
    video_id: VideoId,
    attached_at: Instant,
    startup_time_ms: Option<u64>,
    rebuffer_started: Option<(Instant, f64)>,
    total_buffering_ms: u64,
    buffering_count: u32,
    quality_switches: Vec<QualitySwitch>,
    errors: Vec<ErrorRecord>,
    seeks: Vec<SeekRecord>,
    sequence: u64,
    sink: Option<AnalyticsSink>,
    finalized: Option<AnalyticsSnapshot>,
}

impl AnalyticsTracker {
    pub fn new(session_id: SessionId, video_id: VideoId, sink: Option<AnalyticsSink>) -> Self {
        Self {
            session_id,
            video_id,
            attached_at: Instant::now(),
            startup_time_ms: None,
            rebuffer_started: None,
            total_buffering_ms: 0,
            buffering_count: 0,
            quality_switches: Vec::new(),
            errors: Vec::new(),
            seeks: Vec::new(),
            sequence: 0,
            sink,
            finalized: None,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn record_load(&mut self, url: &url::Url) {
        self.emit(AnalyticsEvent::Load {
            url: url.to_string(),
        });
    }

    /// Feed a committed state change
    pub fn record_state(&mut self, from: PlayerState, to: PlayerState, position: f64) {
        let now = Instant::now();

        if to == PlayerState::Playing && self.startup_time_ms.is_none() {
            let startup = self.elapsed_ms(now);
            self.startup_time_ms = Some(startup);
            self.emit(AnalyticsEvent::Startup {
                startup_time_ms: startup,
            });
        }

        let rebuffering = matches!(to, PlayerState::Buffering | PlayerState::Stalled);
        match (self.rebuffer_started, rebuffering) {
            (None, true) if self.startup_time_ms.is_some() => {
                self.rebuffer_started = Some((now, position));
                self.buffering_count += 1;
                self.emit(AnalyticsEvent::Rebuffer { position });
            }
            (Some((since, _)), false) => {
                let duration_ms = now.duration_since(since).as_millis() as u64;
                self.total_buffering_ms += duration_ms;
                self.rebuffer_started = None;
                self.emit(AnalyticsEvent::RebufferEnd {
                    position,
                    duration_ms,
                });
            }
            _ => {}
        }

        self.emit(AnalyticsEvent::StateChange { from, to, position });
    }

    pub fn record_quality_switch(
        &mut self,
        from: Option<usize>,
        to: Option<usize>,
        bitrate_bps: u64,
        reason: QualityChangeReason,
    ) {
        let at_ms = self.elapsed_ms(Instant::now());
        self.quality_switches.push(QualitySwitch {
            at_ms,
            from,
            to,
            bitrate_bps,
            reason,
        });
        self.emit(AnalyticsEvent::QualityChange {
            from,
            to,
            bitrate_bps,
            reason,
        });
    }

    pub fn record_error(&mut self, error: &StreamError, position: f64) {
        let at_ms = self.elapsed_ms(Instant::now());
        self.errors.push(ErrorRecord {
            at_ms,
            code: error.code().to_string(),
            message: error.details.clone(),
            fatal: error.is_fatal(),
        });
        self.emit(AnalyticsEvent::Error {
            code: error.code().to_string(),
            message: error.details.clone(),
            fatal: error.is_fatal(),
            position,
        });
    }

    pub fn record_seek(&mut self, from: f64, to: f64) {
        let at_ms = self.elapsed_ms(Instant::now());
        self.seeks.push(SeekRecord { at_ms, from, to });
        self.emit(AnalyticsEvent::Seek { from, to });
    }

    /// Current figures; buffering still in progress is counted up to now
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        if let Some(done) = &self.finalized {
            return done.clone();
        }

        let now = Instant::now();
        let open_buffering = self
            .rebuffer_started
            .map(|(since, _)| now.duration_since(since).as_millis() as u64)
            .unwrap_or(0);

        let mut snapshot = AnalyticsSnapshot {
            session_id: self.session_id,
            video_id: self.video_id.clone(),
            startup_time_ms: self.startup_time_ms,
            total_buffering_time_ms: self.total_buffering_ms + open_buffering,
            buffering_count: self.buffering_count,
            quality_switches: self.quality_switches.clone(),
            errors: self.errors.clone(),
            seeks: self.seeks.clone(),
            watch_time_ms: self.elapsed_ms(now),
            qoe_score: 0.0,
            finalized: false,
        };
        snapshot.qoe_score = qoe_score(&snapshot);
        snapshot
    }

    /// Close the session; later calls return the same snapshot
    pub fn finalize(&mut self, position: f64) -> AnalyticsSnapshot {
        if let Some(done) = &self.finalized {
            return done.clone();
        }

        let mut snapshot = self.snapshot();
        snapshot.finalized = true;
        self.emit(AnalyticsEvent::End {
            position,
            watch_time_ms: snapshot.watch_time_ms,
        });
        self.finalized = Some(snapshot.clone());
        snapshot
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.attached_at).as_millis() as u64
    }

    fn emit(&mut self, event: AnalyticsEvent) {
        if self.finalized.is_some() {
            return;
        }
        self.sequence += 1;
        let Some(sink) = &self.sink else {
            return;
        };

        let record = AnalyticsEventRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            video_id: self.video_id.clone(),
            timestamp: Utc::now(),
            sequence: self.sequence,
            event,
        };
        debug!(session_id = %record.session_id, sequence = record.sequence, "Analytics event");

        if sink.send(record).is_err() {
            self.sink = None;
        }
    }
}

/// Quality of Experience score (0-100)
///
/// - startup beyond 1s costs 5 points per second
/// - each rebuffer costs 10 points, each second of rebuffering 5 more
/// - each quality switch costs 2 points
/// - each error costs 5 points, a fatal one 40
pub fn qoe_score(snapshot: &AnalyticsSnapshot) -> f64 {
    let mut score = 100.0;

    if let Some(startup) = snapshot.startup_time_ms {
        let startup_secs = startup as f64 / 1000.0;
        if startup_secs > 1.0 {
            score -= (startup_secs - 1.0) * 5.0;
        }
    }

    score -= snapshot.buffering_count as f64 * 10.0;
    score -= snapshot.total_buffering_time_ms as f64 / 1000.0 * 5.0;
    score -= snapshot.quality_switches.len() as f64 * 2.0;

    for error in &snapshot.errors {
        score -= if error.fatal { 40.0 } else { 5.0 };
    }

    score.clamp(0.0, 100.0)
}
