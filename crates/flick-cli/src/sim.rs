//! Feed simulation against headless surfaces

use anyhow::{bail, Context};
use async_trait::async_trait;
use flick_core::analytics::AnalyticsSnapshot;
use flick_core::engine::TransferSample;
use flick_core::headless::{AutoplayPolicy, HeadlessFactory, HeadlessOptions};
use flick_core::{
    Feed, FeedDeps, FeedEvent, FeedRuntime, FeedStats, FlickConfig, Intent, NetworkSample,
    PlatformCapabilities, PowerSample, ResourceClass, ResourceFetcher, VideoItem,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Scroll velocity reported by the `fast` step, in items per second
const FAST_SCROLL: f64 = 10.0;

/// One action of a swipe script
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Jump(usize),
    Next,
    Prev,
    Play,
    Pause,
    Offline,
    Online,
    LowBattery,
    Charging,
    FastScroll,
    SlowScroll,
}

impl FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let step = match s.trim().to_lowercase().as_str() {
            "next" | "n" => Step::Next,
            "prev" | "p" => Step::Prev,
            "play" => Step::Play,
            "pause" => Step::Pause,
            "offline" => Step::Offline,
            "online" => Step::Online,
            "low-battery" => Step::LowBattery,
            "charging" => Step::Charging,
            "fast" => Step::FastScroll,
            "slow" => Step::SlowScroll,
            other => Step::Jump(
                other
                    .parse()
                    .with_context(|| format!("unknown script step '{other}'"))?,
            ),
        };
        Ok(step)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Jump(index) => write!(f, "jump {index}"),
            Step::Next => write!(f, "next"),
            Step::Prev => write!(f, "prev"),
            Step::Play => write!(f, "play"),
            Step::Pause => write!(f, "pause"),
            Step::Offline => write!(f, "offline"),
            Step::Online => write!(f, "online"),
            Step::LowBattery => write!(f, "low-battery"),
            Step::Charging => write!(f, "charging"),
            Step::FastScroll => write!(f, "fast"),
            Step::SlowScroll => write!(f, "slow"),
        }
    }
}

pub fn parse_script(script: &str) -> anyhow::Result<Vec<Step>> {
    let steps: Vec<Step> = script
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Step::from_str)
        .collect::<anyhow::Result<_>>()?;
    if steps.is_empty() {
        bail!("script has no steps");
    }
    Ok(steps)
}

pub fn parse_autoplay(value: &str) -> anyhow::Result<AutoplayPolicy> {
    match value.to_lowercase().replace('-', "_").as_str() {
        "allowed" => Ok(AutoplayPolicy::Allowed),
        "muted_only" | "muted" => Ok(AutoplayPolicy::MutedOnly),
        "blocked" => Ok(AutoplayPolicy::Blocked),
        other => bail!("unknown autoplay policy '{other}'"),
    }
}

pub struct SimOptions {
    pub videos: usize,
    pub slots: Option<usize>,
    pub script: Vec<Step>,
    pub autoplay: AutoplayPolicy,
    pub latency_ms: u64,
    pub config: Option<PathBuf>,
}

/// Serves every preload after a fixed delay
struct SimulatedFetcher {
    latency: Duration,
}

#[async_trait]
impl ResourceFetcher for SimulatedFetcher {
    async fn fetch(&self, url: &Url, class: ResourceClass, budget: Option<u64>) -> flick_core::Result<TransferSample> {
        tokio::time::sleep(self.latency).await;
        let bytes = budget.unwrap_or(2 * 1024 * 1024);
        debug!(%url, %class, bytes, "Simulated fetch");
        Ok(TransferSample::new(bytes, self.latency))
    }
}

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: String,
    pub stats: FeedStats,
}

#[derive(Debug, Serialize)]
pub struct SimReport {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub steps: Vec<StepReport>,
    /// Count of UI events by kind
    pub events: BTreeMap<String, usize>,
    pub sessions: Vec<AnalyticsSnapshot>,
}

pub fn feed_items(count: usize) -> anyhow::Result<Vec<VideoItem>> {
    (0..count)
        .map(|i| {
            let url = Url::parse(&format!("https://cdn.flick.local/videos/{i:04}/master.m3u8"))?;
            Ok(VideoItem::new(format!("video-{i:04}"), url))
        })
        .collect()
}

fn event_kind(event: &FeedEvent) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Run a script through a feed runtime and collect a report
pub async fn run(options: SimOptions) -> anyhow::Result<SimReport> {
    let mut config = match &options.config {
        Some(path) => FlickConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FlickConfig::default(),
    };
    if let Some(slots) = options.slots {
        config.pool.slot_count = slots;
    }
    if options.videos == 0 {
        bail!("a feed needs at least one video");
    }
    let videos = feed_items(options.videos)?;

    let surfaces = Arc::new(HeadlessFactory::new(
        PlatformCapabilities::default(),
        HeadlessOptions {
            autoplay: options.autoplay,
            echo: true,
            ..Default::default()
        },
    ));
    let latency = Duration::from_millis(options.latency_ms);
    let deps = FeedDeps::new(surfaces, Arc::new(SimulatedFetcher { latency }));
    let (feed, channels) = Feed::new(config, deps)?;
    let (runtime, handle, mut events) = FeedRuntime::new(feed, channels);

    let collector = tokio::spawn(async move {
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        collected
    });
    let task = tokio::spawn(runtime.run());

    info!(videos = options.videos, steps = options.script.len(), "Starting simulation");
    let started_at = chrono::Utc::now();
    let settle = latency + Duration::from_millis(25);
    let mut index = 0usize;
    let mut steps = Vec::with_capacity(options.script.len());

    for step in &options.script {
        match *step {
            Step::Jump(target) => {
                if target >= videos.len() {
                    bail!("step '{step}' is past the end of a {}-video feed", videos.len());
                }
                index = target;
                handle.index_changed(index, videos.clone()).await?;
            }
            Step::Next => {
                index = (index + 1).min(videos.len() - 1);
                handle.index_changed(index, videos.clone()).await?;
            }
            Step::Prev => {
                index = index.saturating_sub(1);
                handle.index_changed(index, videos.clone()).await?;
            }
            Step::Play => handle.intent(Intent::Play).await?,
            Step::Pause => handle.intent(Intent::Pause).await?,
            Step::Offline => handle.network_sample(Some(NetworkSample::offline())).await?,
            Step::Online => handle.network_sample(Some(NetworkSample::with_downlink(10.0))).await?,
            Step::LowBattery => handle.power_sample(Some(PowerSample::new(0.1, false))).await?,
            Step::Charging => handle.power_sample(Some(PowerSample::new(0.1, true))).await?,
            Step::FastScroll => handle.scroll_velocity(FAST_SCROLL).await?,
            Step::SlowScroll => handle.scroll_velocity(0.0).await?,
        }

        tokio::time::sleep(settle).await;
        let stats = handle.stats().await?;
        steps.push(StepReport {
            step: step.to_string(),
            stats,
        });
    }

    handle.shutdown().await?;
    drop(handle);
    let feed = task.await.context("feed runtime panicked")?;
    drop(feed);
    let collected = collector.await.context("event collector panicked")?;

    let mut tally = BTreeMap::new();
    let mut sessions = Vec::new();
    for event in collected {
        *tally.entry(event_kind(&event)).or_insert(0) += 1;
        if let FeedEvent::SessionEnded { analytics, .. } = event {
            sessions.push(analytics);
        }
    }

    Ok(SimReport {
        started_at,
        steps,
        events: tally,
        sessions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script() {
        let steps = parse_script("0, next,prev ,7,offline,fast").unwrap();
        assert_eq!(
            steps,
            vec![Step::Jump(0), Step::Next, Step::Prev, Step::Jump(7), Step::Offline, Step::FastScroll]
        );
        assert!(parse_script("next,sideways").is_err());
        assert!(parse_script(" , ").is_err());
    }

    #[test]
    fn test_parse_autoplay() {
        assert_eq!(parse_autoplay("muted-only").unwrap(), AutoplayPolicy::MutedOnly);
        assert_eq!(parse_autoplay("Blocked").unwrap(), AutoplayPolicy::Blocked);
        assert!(parse_autoplay("sometimes").is_err());
    }

    #[tokio::test]
    async fn test_simulation_binds_pool_and_ends_sessions() {
        let report = run(SimOptions {
            videos: 8,
            slots: None,
            script: vec![Step::Jump(0), Step::Next, Step::Jump(5)],
            autoplay: AutoplayPolicy::Allowed,
            latency_ms: 1,
            config: None,
        })
        .await
        .unwrap();

        assert_eq!(report.steps.len(), 3);
        let last = &report.steps[2].stats;
        assert_eq!(last.current_index, Some(5));
        let mut bound: Vec<usize> = last.slots.iter().filter_map(|s| s.index).collect();
        bound.sort_unstable();
        assert_eq!(bound, vec![4, 5, 6, 7]);
        assert!(report.events.get("state_changed").copied().unwrap_or(0) > 0);
        assert!(report.sessions.iter().all(|s| s.finalized));
    }
}
