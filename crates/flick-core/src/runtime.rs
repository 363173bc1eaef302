//! Async driver for a [`Feed`]
//!
//! [`FeedRuntime::run`] owns the feed and processes, one at a time and in
//! arrival order: commands from a [`FeedHandle`], surface events, engine
//! task results, preload completions, the nearest timer deadline and the
//! periodic memory sweep.

use crate::events::{FeedCommand, FeedEvent, Intent, PlayOutcome};
use crate::feed::{Feed, FeedChannels, FeedStats};
use crate::network::NetworkSample;
use crate::power::PowerSample;
use crate::types::VideoItem;
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;

/// Cloneable sender side of a running feed
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::Sender<FeedCommand>,
}

impl FeedHandle {
    pub async fn send(&self, command: FeedCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Internal("feed runtime has stopped".into()))
    }

    pub async fn index_changed(&self, index: usize, videos: Vec<VideoItem>) -> Result<()> {
        self.send(FeedCommand::IndexChanged { index, videos }).await
    }

    pub async fn intent(&self, intent: Intent) -> Result<()> {
        self.send(FeedCommand::Intent(intent)).await
    }

    pub async fn scroll_velocity(&self, velocity: f64) -> Result<()> {
        self.send(FeedCommand::ScrollVelocity(velocity)).await
    }

    pub async fn network_sample(&self, sample: Option<NetworkSample>) -> Result<()> {
        self.send(FeedCommand::NetworkSample(sample)).await
    }

    pub async fn power_sample(&self, sample: Option<PowerSample>) -> Result<()> {
        self.send(FeedCommand::PowerSample(sample)).await
    }

    pub async fn stats(&self) -> Result<FeedStats> {
        let (tx, rx) = oneshot::channel();
        self.send(FeedCommand::Stats(tx)).await?;
        rx.await
            .map_err(|_| Error::Internal("feed runtime dropped the stats request".into()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(FeedCommand::Shutdown).await
    }
}

pub struct FeedRuntime {
    feed: Feed,
    commands: mpsc::Receiver<FeedCommand>,
    surface_events: mpsc::UnboundedReceiver<crate::engine::SurfaceEvent>,
    engine_tasks: mpsc::UnboundedReceiver<crate::engine::EngineTaskResult>,
    completions: mpsc::UnboundedReceiver<crate::preload::FetchCompletion>,
}

impl FeedRuntime {
    /// Returns the runtime, a handle to drive it, and the UI event stream
    pub fn new(feed: Feed, channels: FeedChannels) -> (Self, FeedHandle, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let FeedChannels {
            surface_events,
            engine_tasks,
            completions,
            events,
        } = channels;

        let runtime = Self {
            feed,
            commands,
            surface_events,
            engine_tasks,
            completions,
        };
        (runtime, FeedHandle { commands: tx }, events)
    }

    /// Run until shut down or every handle is dropped; returns the feed
    pub async fn run(mut self) -> Feed {
        let mut sweep = tokio::time::interval(self.feed.config().memory.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        sweep.tick().await;

        info!("Feed runtime started");
        loop {
            let deadline = self.feed.next_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All feed handles dropped");
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.surface_events.recv() => {
                    if let Err(e) = self.feed.handle_surface_event(event).await {
                        warn!(error = %e, "Surface event dropped");
                    }
                }
                Some(result) = self.engine_tasks.recv() => {
                    if let Err(e) = self.feed.handle_engine_task(result).await {
                        warn!(error = %e, "Engine task result dropped");
                    }
                }
                Some(completion) = self.completions.recv() => {
                    self.feed.handle_fetch_completion(completion);
                }
                _ = wait_until(deadline) => {
                    self.feed.poll_timers(Instant::now());
                }
                _ = sweep.tick() => {
                    let disposed = self.feed.sweep_memory();
                    if disposed > 0 {
                        debug!(disposed, "Memory sweep");
                    }
                    self.feed.refresh_monitors().await;
                }
            }
        }

        self.feed.shutdown();
        info!("Feed runtime stopped");
        self.feed
    }

    /// Returns false when the loop should stop
    async fn handle_command(&mut self, command: FeedCommand) -> bool {
        match command {
            FeedCommand::IndexChanged { index, videos } => {
                if let Err(e) = self.feed.on_index_change(index, videos).await {
                    warn!(index, error = %e, "Index change rejected");
                }
            }
            FeedCommand::Intent(intent) => match self.feed.handle_intent(intent).await {
                Ok(Some(PlayOutcome::GestureRequired)) => info!("Playback waiting for a user gesture"),
                Ok(outcome) => debug!(?outcome, "Intent applied"),
                Err(e) => warn!(error = %e, "Intent failed"),
            },
            FeedCommand::ScrollVelocity(velocity) => self.feed.on_scroll_velocity(velocity),
            FeedCommand::NetworkSample(sample) => self.feed.apply_network_sample(sample).await,
            FeedCommand::PowerSample(sample) => self.feed.apply_power_sample(sample).await,
            FeedCommand::Stats(reply) => {
                let _ = reply.send(self.feed.stats());
            }
            FeedCommand::Shutdown => return false,
        }
        true
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlickConfig;
    use crate::engine::{PlatformCapabilities, TransferSample};
    use crate::feed::FeedDeps;
    use crate::headless::{HeadlessFactory, HeadlessOptions};
    use crate::preload::ResourceFetcher;
    use crate::types::{PlayerState, ResourceClass};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    struct InstantFetcher;

    #[async_trait]
    impl ResourceFetcher for InstantFetcher {
        async fn fetch(&self, _url: &Url, _class: ResourceClass, budget: Option<u64>) -> Result<TransferSample> {
            Ok(TransferSample::new(budget.unwrap_or(4096), Duration::from_millis(20)))
        }
    }

    fn videos(n: usize) -> Vec<VideoItem> {
        (0..n)
            .map(|i| VideoItem::new(format!("v{i}"), Url::parse(&format!("https://cdn.example.com/{i}.mp4")).unwrap()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_plays_current_video() {
        let surfaces = Arc::new(HeadlessFactory::new(
            PlatformCapabilities::default(),
            HeadlessOptions { echo: true, ..Default::default() },
        ));
        let deps = FeedDeps::new(surfaces, Arc::new(InstantFetcher));
        let (feed, channels) = Feed::new(FlickConfig::default(), deps).unwrap();
        let (runtime, handle, mut events) = FeedRuntime::new(feed, channels);
        let task = tokio::spawn(runtime.run());

        handle.index_changed(0, videos(10)).await.unwrap();

        let playing = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let FeedEvent::StateChanged { video_id, state: PlayerState::Playing, .. } = event {
                    return Some(video_id);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(playing.unwrap().as_str(), "v0");

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.current_index, Some(0));
        assert_eq!(stats.slots.iter().filter(|s| s.index.is_some()).count(), 4);

        handle.shutdown().await.unwrap();
        let feed = task.await.unwrap();
        assert!(feed.pool().slots().iter().all(|s| s.index().is_none()));
    }

    #[tokio::test]
    async fn test_handle_fails_after_stop() {
        let surfaces = Arc::new(HeadlessFactory::new(PlatformCapabilities::default(), HeadlessOptions::default()));
        let deps = FeedDeps::new(surfaces, Arc::new(InstantFetcher));
        let (feed, channels) = Feed::new(FlickConfig::default(), deps).unwrap();
        let (runtime, handle, _events) = FeedRuntime::new(feed, channels);
        let task = tokio::spawn(runtime.run());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(handle.stats().await.is_err());
    }
}
