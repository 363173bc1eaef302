//! Integration tests for Flick Core

use async_trait::async_trait;
use flick_core::analytics::AnalyticsEventRecord;
use flick_core::config::{FlickConfig, StateMachineConfig};
use flick_core::engine::{MediaEventKind, MediaFailure, TransferSample};
use flick_core::feed::FeedChannels;
use flick_core::headless::{AutoplayPolicy, HeadlessFactory, HeadlessHandle, HeadlessOptions};
use flick_core::preload::FetchCompletion;
use flick_core::{
    Feed, FeedDeps, FeedEvent, Intent, NetworkSample, PlatformCapabilities, PlayOutcome, PlaybackStateMachine,
    PlayerState, PowerSample, PreloadScheduler, ResourceClass, ResourceFetcher, SlotId, VideoItem,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use url::Url;

// =============================================================================
// Fixtures
// =============================================================================

/// Never resolves; preloads stay in flight
struct PendingFetcher;

#[async_trait]
impl ResourceFetcher for PendingFetcher {
    async fn fetch(&self, _url: &Url, _class: ResourceClass, _budget: Option<u64>) -> flick_core::Result<TransferSample> {
        std::future::pending().await
    }
}

fn videos(n: usize) -> Vec<VideoItem> {
    (0..n)
        .map(|i| VideoItem::new(format!("v{i}"), Url::parse(&format!("https://cdn.example.com/v{i}.mp4")).unwrap()))
        .collect()
}

fn url(i: usize) -> Url {
    Url::parse(&format!("https://cdn.example.com/v{i}.mp4")).unwrap()
}

struct Harness {
    feed: Feed,
    channels: FeedChannels,
    surfaces: Arc<HeadlessFactory>,
}

impl Harness {
    fn new(options: HeadlessOptions) -> Self {
        Self::with_config(FlickConfig::default(), options, None)
    }

    fn with_config(
        config: FlickConfig,
        options: HeadlessOptions,
        analytics: Option<mpsc::UnboundedSender<AnalyticsEventRecord>>,
    ) -> Self {
        let surfaces = Arc::new(HeadlessFactory::new(PlatformCapabilities::default(), options));
        let mut deps = FeedDeps::new(surfaces.clone(), Arc::new(PendingFetcher));
        if let Some(sink) = analytics {
            deps = deps.with_analytics(sink);
        }
        let (feed, channels) = Feed::new(config, deps).unwrap();
        Self {
            feed,
            channels,
            surfaces,
        }
    }

    /// Deliver queued surface events and engine results until idle
    async fn pump(&mut self) {
        loop {
            if let Ok(event) = self.channels.surface_events.try_recv() {
                self.feed.handle_surface_event(event).await.unwrap();
            } else if let Ok(result) = self.channels.engine_tasks.try_recv() {
                self.feed.handle_engine_task(result).await.unwrap();
            } else {
                break;
            }
        }
    }

    fn drain_events(&mut self) -> Vec<FeedEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.channels.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn handle_for_index(&self, index: usize) -> HeadlessHandle {
        let slot = self.feed.pool().slot_for_index(index).expect("index bound");
        self.surfaces.handle(slot).expect("surface created")
    }

    fn state_at(&self, index: usize) -> PlayerState {
        let slot = self.feed.pool().slot_for_index(index).expect("index bound");
        self.feed.pool().controller(slot).unwrap().state()
    }

    fn bound_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.feed.pool().slots().iter().filter_map(|s| s.index()).collect();
        indices.sort_unstable();
        indices
    }
}

fn fatal_count(events: &[FeedEvent]) -> usize {
    events.iter().filter(|e| matches!(e, FeedEvent::Fatal { .. })).count()
}

// =============================================================================
// State Machine Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_buffering_past_threshold_stalls() {
    let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
    machine.transition(PlayerState::Loading).unwrap();
    machine.transition(PlayerState::Buffering).unwrap();

    tokio::time::advance(Duration::from_millis(3_001)).await;
    let change = machine.on_stall_timer(tokio::time::Instant::now()).unwrap();
    assert_eq!(change.state, PlayerState::Stalled);
    assert_eq!(change.previous, PlayerState::Buffering);
}

#[tokio::test(start_paused = true)]
async fn test_leaving_buffering_early_never_stalls() {
    let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
    machine.transition(PlayerState::Loading).unwrap();
    machine.transition(PlayerState::Buffering).unwrap();
    tokio::time::advance(Duration::from_millis(2_000)).await;
    machine.transition(PlayerState::Ready).unwrap();

    tokio::time::advance(Duration::from_millis(2_000)).await;
    assert!(machine.on_stall_timer(tokio::time::Instant::now()).is_none());
    assert!(machine.stall_deadline().is_none());
    assert_eq!(machine.state(), PlayerState::Ready);
}

#[test]
fn test_invalid_transition_leaves_state() {
    let mut machine = PlaybackStateMachine::new(&StateMachineConfig::default());
    assert!(machine.transition(PlayerState::Playing).is_err());
    assert_eq!(machine.state(), PlayerState::Idle);
}

// =============================================================================
// Pool Tests
// =============================================================================

#[tokio::test]
async fn test_pool_binds_around_start_of_feed() {
    let mut h = Harness::new(HeadlessOptions::default());
    let update = h.feed.on_index_change(0, videos(10)).await.unwrap();

    assert_eq!(update.attached.len(), 4);
    assert_eq!(h.bound_indices(), vec![0, 1, 2, 3]);
    let empty = h.feed.pool().slots().iter().filter(|s| s.index().is_none()).count();
    assert_eq!(empty, 1);

    let governor = h.feed.governor();
    for i in 0..4 {
        assert!(governor.is_resident(&format!("v{i}").as_str().into()));
    }
    assert!(governor.has_decoded(&"v0".into()));
    assert!(governor.has_decoded(&"v1".into()));
    assert!(!governor.has_decoded(&"v2".into()));
}

#[tokio::test]
async fn test_pool_rebinds_and_evicts_on_jump() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(10)).await.unwrap();
    h.feed.on_index_change(5, videos(10)).await.unwrap();

    assert_eq!(h.bound_indices(), vec![4, 5, 6, 7, 8]);
    let governor = h.feed.governor();
    for i in 0..4 {
        let id = format!("v{i}").as_str().into();
        assert!(!governor.is_resident(&id), "v{i} should not be resident");
        assert!(!governor.has_decoded(&id), "v{i} should not be decoded");
    }
    assert_eq!(governor.stats().resident, 5);
    assert_eq!(governor.stats().decoded, 3);
}

#[tokio::test]
async fn test_pool_single_step_reuses_furthest_slot() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(3, videos(10)).await.unwrap();
    assert_eq!(h.bound_indices(), vec![2, 3, 4, 5, 6]);
    let slot_of_two = h.feed.pool().slot_for_index(2).unwrap();

    let update = h.feed.on_index_change(4, videos(10)).await.unwrap();
    assert_eq!(h.bound_indices(), vec![3, 4, 5, 6, 7]);
    assert_eq!(update.kept, 4);
    assert_eq!(update.attached, vec![(slot_of_two, 7)]);
}

#[tokio::test]
async fn test_pool_never_duplicates_indices() {
    let mut h = Harness::new(HeadlessOptions::default());
    for index in [0, 1, 2, 9, 4, 5, 5, 0, 8] {
        h.feed.on_index_change(index, videos(10)).await.unwrap();
        let bound = h.bound_indices();
        let mut unique = bound.clone();
        unique.dedup();
        assert_eq!(bound, unique);
        assert!(bound.len() <= 5);
        assert!(bound.contains(&index));
    }
}

#[tokio::test]
async fn test_index_out_of_range_is_rejected() {
    let mut h = Harness::new(HeadlessOptions::default());
    let err = h.feed.on_index_change(10, videos(10)).await.unwrap_err();
    assert_eq!(err.error_code(), "INDEX_RANGE");
}

#[tokio::test]
async fn test_rejected_index_change_keeps_feed_consistent() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(10)).await.unwrap();
    let before = h.feed.stats();

    let err = assert_err!(h.feed.on_index_change(12, videos(5)).await);
    assert_eq!(err.error_code(), "INDEX_RANGE");

    let after = h.feed.stats();
    assert_eq!(after.video_count, 10);
    assert_eq!(after.current_index, Some(0));
    assert_eq!(after.slots, before.slots);

    assert_ok!(h.feed.handle_intent(Intent::Next).await);
    assert_eq!(h.feed.current_index(), Some(1));
    assert_eq!(h.bound_indices(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_retained_positions_are_preloaded_without_slot() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(10)).await.unwrap();

    let scheduler = h.feed.scheduler();
    assert!(scheduler.task(&url(0)).is_none());
    assert_eq!(scheduler.task(&url(4)).unwrap().resource_class, ResourceClass::Metadata);
    assert_eq!(scheduler.task(&url(5)).unwrap().resource_class, ResourceClass::Metadata);
    assert!(scheduler.task(&url(6)).is_none());
    assert!(h.feed.pool().slot_for_index(4).is_none());
}

// =============================================================================
// Preload Tests
// =============================================================================

#[tokio::test]
async fn test_preload_reenqueue_keeps_one_task() {
    let (tx, _rx) = mpsc::unbounded_channel::<FetchCompletion>();
    let mut scheduler = PreloadScheduler::new(Default::default(), Arc::new(PendingFetcher), tx);
    scheduler.set_paused(true);

    scheduler.enqueue(url(1), 3, ResourceClass::Metadata);
    scheduler.enqueue(url(1), 9, ResourceClass::Metadata);
    assert_eq!(scheduler.tasks().len(), 1);
    assert_eq!(scheduler.tasks()[0].priority, 9);
}

#[tokio::test]
async fn test_preload_cancel_frees_slot_for_next() {
    let (tx, _rx) = mpsc::unbounded_channel::<FetchCompletion>();
    let mut scheduler = PreloadScheduler::new(Default::default(), Arc::new(PendingFetcher), tx);
    scheduler.enqueue(url(1), 9, ResourceClass::Full);
    scheduler.enqueue(url(2), 8, ResourceClass::Full);
    scheduler.enqueue(url(3), 7, ResourceClass::Full);
    assert_eq!(scheduler.in_flight(), 2);

    scheduler.cancel(&url(2));
    assert_eq!(scheduler.in_flight(), 2);
    assert_eq!(scheduler.status(&url(3)), Some(flick_core::PreloadStatus::Loading));
}

#[tokio::test]
async fn test_fast_scroll_pauses_preloading() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_scroll_velocity(12.0);
    h.feed.on_index_change(0, videos(10)).await.unwrap();
    assert_eq!(h.feed.scheduler().in_flight(), 0);
    assert!(h.feed.stats().preload.paused);

    h.feed.on_scroll_velocity(0.0);
    assert_eq!(h.feed.scheduler().in_flight(), 2);
}

// =============================================================================
// Controller Tests
// =============================================================================

#[tokio::test]
async fn test_volume_zero_mutes_then_unmutes() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(3)).await.unwrap();

    h.feed.handle_intent(Intent::SetVolume { volume: 0.0 }).await.unwrap();
    assert!(h.feed.snapshot().unwrap().muted);

    h.feed.handle_intent(Intent::SetVolume { volume: 0.4 }).await.unwrap();
    let snapshot = h.feed.snapshot().unwrap();
    assert!(!snapshot.muted);
    assert_eq!(snapshot.volume, 0.4);
}

#[tokio::test]
async fn test_current_video_autoplays_when_ready() {
    let mut h = Harness::new(HeadlessOptions { echo: true, ..Default::default() });
    h.feed.on_index_change(0, videos(5)).await.unwrap();
    h.pump().await;

    assert_eq!(h.state_at(0), PlayerState::Playing);
    assert_eq!(h.state_at(1), PlayerState::Ready);
    assert!(h.handle_for_index(0).is_playing());
    assert!(!h.handle_for_index(1).is_playing());
}

#[tokio::test]
async fn test_muted_autoplay_fallback() {
    let mut h = Harness::new(HeadlessOptions {
        echo: true,
        autoplay: AutoplayPolicy::MutedOnly,
        ..Default::default()
    });
    h.feed.on_index_change(0, videos(5)).await.unwrap();
    h.pump().await;

    assert_eq!(h.state_at(0), PlayerState::Playing);
    assert!(h.feed.snapshot().unwrap().muted);
    let events = h.drain_events();
    assert!(!events.iter().any(|e| matches!(e, FeedEvent::GestureRequired { .. })));
}

#[tokio::test]
async fn test_blocked_autoplay_asks_for_gesture() {
    let mut h = Harness::new(HeadlessOptions {
        echo: true,
        autoplay: AutoplayPolicy::Blocked,
        ..Default::default()
    });
    h.feed.on_index_change(0, videos(5)).await.unwrap();
    h.pump().await;

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, FeedEvent::GestureRequired { slot, .. } if *slot == SlotId(0))));
    assert_eq!(fatal_count(&events), 0);
    assert_eq!(h.state_at(0), PlayerState::Ready);

    let outcome = h.feed.handle_intent(Intent::Play).await.unwrap();
    assert_eq!(outcome, Some(PlayOutcome::GestureRequired));
}

#[tokio::test]
async fn test_seek_intent_is_clamped() {
    let mut h = Harness::new(HeadlessOptions { echo: true, duration: 12.0, ..Default::default() });
    h.feed.on_index_change(0, videos(2)).await.unwrap();
    h.pump().await;

    h.feed.handle_intent(Intent::Seek { position: 99.0 }).await.unwrap();
    h.pump().await;
    assert_eq!(h.feed.snapshot().unwrap().current_time, 12.0);
}

#[tokio::test]
async fn test_next_and_prev_intents_move_the_feed() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(3)).await.unwrap();

    h.feed.handle_intent(Intent::Prev).await.unwrap();
    assert_eq!(h.feed.current_index(), Some(0));
    h.feed.handle_intent(Intent::Next).await.unwrap();
    h.feed.handle_intent(Intent::Next).await.unwrap();
    assert_eq!(h.feed.current_index(), Some(2));
    h.feed.handle_intent(Intent::Next).await.unwrap();
    assert_eq!(h.feed.current_index(), Some(2));
}

// =============================================================================
// Error Recovery Tests
// =============================================================================

#[tokio::test]
async fn test_three_network_failures_recover_fourth_is_fatal() {
    let mut h = Harness::new(HeadlessOptions { echo: true, ..Default::default() });
    h.feed.on_index_change(0, videos(3)).await.unwrap();
    h.pump().await;
    h.drain_events();
    let handle = h.handle_for_index(0);

    for _ in 0..3 {
        handle.emit(MediaEventKind::Error(MediaFailure::network("segment timeout")));
        h.pump().await;
    }
    assert_eq!(fatal_count(&h.drain_events()), 0);
    assert_ne!(h.state_at(0), PlayerState::Error);

    let (_, token) = handle.source().unwrap();
    handle.emit(MediaEventKind::Error(MediaFailure::network("segment timeout")));
    handle.emit_with(token, MediaEventKind::Error(MediaFailure::network("segment timeout")));
    h.pump().await;

    let events = h.drain_events();
    assert_eq!(fatal_count(&events), 1);
    assert_eq!(h.state_at(0), PlayerState::Error);
    assert!(handle.source().is_none());

    h.feed.handle_intent(Intent::Retry).await.unwrap();
    h.pump().await;
    assert_eq!(h.state_at(0), PlayerState::Playing);
}

#[tokio::test]
async fn test_events_from_reused_slot_are_ignored() {
    let mut h = Harness::new(HeadlessOptions::default());
    h.feed.on_index_change(0, videos(10)).await.unwrap();
    let handle = h.handle_for_index(0);
    let (_, stale) = handle.source().unwrap();

    h.feed.on_index_change(5, videos(10)).await.unwrap();
    h.drain_events();
    for _ in 0..4 {
        handle.emit_with(stale, MediaEventKind::Error(MediaFailure::network("late")));
    }
    h.pump().await;
    assert_eq!(fatal_count(&h.drain_events()), 0);
}

// =============================================================================
// Auto-Pause Tests
// =============================================================================

#[tokio::test]
async fn test_offline_pauses_and_online_resumes() {
    let mut h = Harness::new(HeadlessOptions { echo: true, ..Default::default() });
    h.feed.on_index_change(0, videos(3)).await.unwrap();
    h.pump().await;
    h.drain_events();

    h.feed.apply_network_sample(Some(NetworkSample::offline())).await;
    h.pump().await;
    assert_eq!(h.state_at(0), PlayerState::Paused);
    assert!(h.feed.stats().preload.paused);

    h.feed.apply_network_sample(Some(NetworkSample::with_downlink(20.0))).await;
    h.pump().await;
    assert_eq!(h.state_at(0), PlayerState::Playing);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, FeedEvent::AutoPaused { .. })));
    assert!(events.iter().any(|e| matches!(e, FeedEvent::AutoResumed { .. })));
}

#[tokio::test]
async fn test_resume_waits_for_every_inhibitor() {
    let mut h = Harness::new(HeadlessOptions { echo: true, ..Default::default() });
    h.feed.on_index_change(0, videos(3)).await.unwrap();
    h.pump().await;

    h.feed.apply_network_sample(Some(NetworkSample::offline())).await;
    h.feed.apply_power_sample(Some(PowerSample::new(0.1, false))).await;
    h.pump().await;

    h.feed.apply_network_sample(Some(NetworkSample::with_downlink(20.0))).await;
    h.pump().await;
    assert_eq!(h.state_at(0), PlayerState::Paused);

    h.feed.apply_power_sample(Some(PowerSample::new(0.1, true))).await;
    h.pump().await;
    assert_eq!(h.state_at(0), PlayerState::Playing);
}

#[tokio::test]
async fn test_missing_probes_are_neutral() {
    let mut h = Harness::new(HeadlessOptions { echo: true, ..Default::default() });
    h.feed.on_index_change(0, videos(3)).await.unwrap();
    h.pump().await;

    h.feed.refresh_monitors().await;
    h.feed.apply_network_sample(None).await;
    h.feed.apply_power_sample(None).await;
    h.pump().await;

    assert_eq!(h.state_at(0), PlayerState::Playing);
    let stats = h.feed.stats();
    assert!(!stats.preload.paused);
    assert!(!stats.power.power_saving);
}

// =============================================================================
// Analytics & Config Tests
// =============================================================================

#[tokio::test]
async fn test_session_end_finalizes_analytics() {
    let (sink, mut records) = mpsc::unbounded_channel();
    let mut h = Harness::with_config(
        FlickConfig::default(),
        HeadlessOptions { echo: true, ..Default::default() },
        Some(sink),
    );
    h.feed.on_index_change(0, videos(10)).await.unwrap();
    h.pump().await;
    h.feed.on_index_change(5, videos(10)).await.unwrap();

    let ended: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            FeedEvent::SessionEnded { analytics, .. } => Some(analytics),
            _ => None,
        })
        .collect();
    let first = ended.iter().find(|a| a.video_id.as_str() == "v0").unwrap();
    assert!(first.finalized);
    assert!(first.startup_time_ms.is_some());

    let mut last_seq = None;
    while let Ok(record) = records.try_recv() {
        if record.video_id.as_str() == "v0" {
            assert!(last_seq.map_or(true, |s| record.sequence > s));
            last_seq = Some(record.sequence);
        }
    }
    assert!(last_seq.is_some());
}

#[test]
fn test_config_defaults_and_validation() {
    let config = FlickConfig::from_json_str(r#"{ "pool": { "slot_count": 3 } }"#).unwrap();
    assert_eq!(config.pool.slot_count, 3);
    assert_eq!(config.pool.window, 10);
    assert_eq!(config.preload.max_concurrent, 2);
    assert_eq!(config.memory.ceiling_mb, 150.0);

    let invalid = FlickConfig::from_json_str(r#"{ "memory": { "max_resident": 2, "max_decoded": 3 } }"#);
    assert!(invalid.is_err());
}

#[test]
fn test_feed_rejects_zero_sweep_interval() {
    let mut config = FlickConfig::default();
    config.memory.sweep_interval_ms = 0;
    let surfaces = Arc::new(HeadlessFactory::new(PlatformCapabilities::default(), HeadlessOptions::default()));
    let deps = FeedDeps::new(surfaces, Arc::new(PendingFetcher));
    let Err(err) = Feed::new(config, deps) else {
        panic!("a zero sweep interval must be rejected");
    };
    assert_eq!(err.error_code(), "INVALID_CONFIG");
}
