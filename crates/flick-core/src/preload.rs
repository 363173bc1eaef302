//! Preload scheduling
//!
//! A bounded priority queue of resource fetches for upcoming feed positions.
//! Tasks are unique per URL and ordered by descending priority, ties broken
//! by insertion order. At most `max_concurrent` fetches run at once; every
//! completion, failure or cancellation frees its slot and pulls the next
//! pending task straight away.
//!
//! Fetches run as spawned tasks and report back through a channel. Each
//! fetch carries a ticket, so a result that arrives after its task was
//! cancelled or restarted is ignored.

use crate::config::PreloadConfig;
use crate::engine::bandwidth::TransferSample;
use crate::types::{PreloadStatus, ResourceClass};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use url::Url;

#[cfg(feature = "http")]
use reqwest::Client;
#[cfg(feature = "http")]
use std::time::Duration;

/// A queued preload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadTask {
    pub url: Url,
    /// Higher is more urgent
    pub priority: i32,
    pub resource_class: ResourceClass,
    pub status: PreloadStatus,
    /// Insertion order, kept across re-enqueues
    pub seq: u64,
}

/// Fetches a resource up to the budget of its class
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// `budget` is the number of leading bytes wanted; `None` for the whole body
    async fn fetch(&self, url: &Url, class: ResourceClass, budget: Option<u64>) -> Result<TransferSample>;
}

/// Result of one fetch, delivered back to the scheduler
#[derive(Debug)]
pub struct FetchCompletion {
    pub url: Url,
    pub ticket: u64,
    pub result: Result<TransferSample>,
}

/// Why dequeuing is halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    Power,
    Network,
    Velocity,
}

/// Scheduler counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreloadStats {
    pub queued: usize,
    pub in_flight: usize,
    pub errored: usize,
    pub loaded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub paused: bool,
    pub pause_reasons: Vec<PauseReason>,
}

struct InFlight {
    ticket: u64,
    class: ResourceClass,
    handle: JoinHandle<()>,
}

pub struct PreloadScheduler {
    config: PreloadConfig,
    fetcher: Arc<dyn ResourceFetcher>,
    completions: mpsc::UnboundedSender<FetchCompletion>,
    /// Sorted by descending priority, then ascending seq
    tasks: Vec<PreloadTask>,
    in_flight: HashMap<Url, InFlight>,
    /// Resource class already fetched per URL
    loaded: HashMap<Url, ResourceClass>,
    pause_reasons: BTreeSet<PauseReason>,
    next_seq: u64,
    next_ticket: u64,
    loaded_count: u64,
    failed_count: u64,
    cancelled_count: u64,
}

impl PreloadScheduler {
    pub fn new(
        config: PreloadConfig,
        fetcher: Arc<dyn ResourceFetcher>,
        completions: mpsc::UnboundedSender<FetchCompletion>,
    ) -> Self {
        Self {
            config,
            fetcher,
            completions,
            tasks: Vec::new(),
            in_flight: HashMap::new(),
            loaded: HashMap::new(),
            pause_reasons: BTreeSet::new(),
            next_seq: 0,
            next_ticket: 0,
            loaded_count: 0,
            failed_count: 0,
            cancelled_count: 0,
        }
    }

    /// Queue a URL or update its queued task; true if the queue changed
    #[instrument(skip(self), fields(url = %url))]
    pub fn enqueue(&mut self, url: Url, priority: i32, class: ResourceClass) -> bool {
        if let Some(&fetched) = self.loaded.get(&url) {
            if fetched >= class && !self.tasks.iter().any(|t| t.url == url) {
                return false;
            }
        }

        if let Some(task) = self.tasks.iter_mut().find(|t| t.url == url) {
            let mut changed = false;
            if task.priority != priority {
                task.priority = priority;
                changed = true;
            }
            if class > task.resource_class {
                task.resource_class = class;
                changed = true;
            }
            if task.status == PreloadStatus::Error {
                task.status = PreloadStatus::Pending;
                changed = true;
            }
            if changed {
                debug!(priority, class = %task.resource_class, "Preload task updated");
                self.sort();
                self.pump();
            }
            return changed;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.push(PreloadTask {
            url: url.clone(),
            priority,
            resource_class: class,
            status: PreloadStatus::Pending,
            seq,
        });
        self.sort();
        self.trim();
        debug!(priority, %class, queued = self.tasks.len(), "Preload task queued");

        let kept = self.tasks.iter().any(|t| t.url == url);
        self.pump();
        kept
    }

    /// Remove a task and abandon its fetch
    pub fn cancel(&mut self, url: &Url) -> bool {
        let removed = self.remove_task(url);
        if removed {
            debug!(%url, "Preload cancelled");
            self.pump();
        }
        removed
    }

    /// Cancel every task whose URL is not in `relevant`; returns how many
    pub fn retain_relevant(&mut self, relevant: &HashSet<Url>) -> usize {
        let stale: Vec<Url> = self
            .tasks
            .iter()
            .filter(|t| !relevant.contains(&t.url))
            .map(|t| t.url.clone())
            .collect();
        for url in &stale {
            self.remove_task(url);
        }
        self.loaded.retain(|url, _| relevant.contains(url));

        if !stale.is_empty() {
            debug!(removed = stale.len(), "Dropped preloads outside the window");
            self.pump();
        }
        stale.len()
    }

    /// Apply a fetch result; returns the transfer sample on success
    pub fn handle_completion(&mut self, completion: FetchCompletion) -> Option<TransferSample> {
        let FetchCompletion { url, ticket, result } = completion;
        let current = self.in_flight.get(&url).map(|f| f.ticket);
        if current != Some(ticket) {
            debug!(%url, ticket, "Ignoring result of abandoned preload");
            return None;
        }
        let flight = self.in_flight.remove(&url)?;

        let outcome = match result {
            Ok(sample) => {
                self.loaded_count += 1;
                let entry = self.loaded.entry(url.clone()).or_insert(flight.class);
                *entry = (*entry).max(flight.class);

                if let Some(pos) = self.tasks.iter().position(|t| t.url == url) {
                    if self.tasks[pos].resource_class > flight.class {
                        // Upgraded while in flight
                        self.tasks[pos].status = PreloadStatus::Pending;
                    } else {
                        self.tasks.remove(pos);
                    }
                }
                debug!(%url, bytes = sample.bytes, elapsed_ms = sample.elapsed.as_millis() as u64, "Preload complete");
                Some(sample)
            }
            Err(e) => {
                self.failed_count += 1;
                warn!(%url, error = %e, "Preload failed");
                if let Some(task) = self.tasks.iter_mut().find(|t| t.url == url) {
                    task.status = PreloadStatus::Error;
                }
                None
            }
        };

        self.pump();
        outcome
    }

    /// Halt or resume dequeuing by hand
    pub fn set_paused(&mut self, paused: bool) {
        self.set_pause_reason(PauseReason::Manual, paused);
    }

    /// Dequeuing resumes only once every reason has cleared
    pub fn set_pause_reason(&mut self, reason: PauseReason, active: bool) {
        let changed = if active {
            self.pause_reasons.insert(reason)
        } else {
            self.pause_reasons.remove(&reason)
        };
        if changed {
            debug!(?reason, active, paused = self.is_paused(), "Preload pause changed");
            self.pump();
        }
    }

    /// Pause while scrolling faster than the threshold (items per second)
    pub fn handle_scroll_velocity(&mut self, velocity: f64) {
        let fast = velocity.abs() > self.config.velocity_threshold;
        self.set_pause_reason(PauseReason::Velocity, fast);
    }

    pub fn is_paused(&self) -> bool {
        !self.pause_reasons.is_empty()
    }

    pub fn tasks(&self) -> &[PreloadTask] {
        &self.tasks
    }

    pub fn task(&self, url: &Url) -> Option<&PreloadTask> {
        self.tasks.iter().find(|t| &t.url == url)
    }

    /// Status of a URL; `Loaded` once fetched and out of the queue
    pub fn status(&self, url: &Url) -> Option<PreloadStatus> {
        self.task(url)
            .map(|t| t.status)
            .or_else(|| self.loaded.contains_key(url).then_some(PreloadStatus::Loaded))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> PreloadStats {
        PreloadStats {
            queued: self.count(PreloadStatus::Pending),
            in_flight: self.in_flight.len(),
            errored: self.count(PreloadStatus::Error),
            loaded: self.loaded_count,
            failed: self.failed_count,
            cancelled: self.cancelled_count,
            paused: self.is_paused(),
            pause_reasons: self.pause_reasons.iter().copied().collect(),
        }
    }

    /// Abort every fetch and drop the queue
    pub fn clear(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        self.cancelled_count += self.tasks.len() as u64;
        self.tasks.clear();
    }

    fn count(&self, status: PreloadStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    fn sort(&mut self) {
        self.tasks
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    /// Drop the least urgent pending tasks beyond the queue bound
    fn trim(&mut self) {
        while self.tasks.len() > self.config.max_queue.max(1) {
            let Some(pos) = self.tasks.iter().rposition(|t| t.status != PreloadStatus::Loading) else {
                break;
            };
            let task = self.tasks.remove(pos);
            self.cancelled_count += 1;
            debug!(url = %task.url, priority = task.priority, "Preload queue full, dropped task");
        }
    }

    fn remove_task(&mut self, url: &Url) -> bool {
        let Some(pos) = self.tasks.iter().position(|t| &t.url == url) else {
            return false;
        };
        self.tasks.remove(pos);
        if let Some(flight) = self.in_flight.remove(url) {
            flight.handle.abort();
        }
        self.cancelled_count += 1;
        true
    }

    /// Start pending tasks while under the concurrency cap
    fn pump(&mut self) {
        if self.is_paused() {
            return;
        }
        while self.in_flight.len() < self.config.max_concurrent.max(1) {
            let Some(task) = self.tasks.iter_mut().find(|t| t.status == PreloadStatus::Pending) else {
                break;
            };
            task.status = PreloadStatus::Loading;
            let (url, class) = (task.url.clone(), task.resource_class);
            self.start_fetch(url, class);
        }
    }

    fn start_fetch(&mut self, url: Url, class: ResourceClass) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let budget = match class {
            ResourceClass::Metadata => Some(self.config.metadata_bytes),
            ResourceClass::Partial => Some(self.config.partial_bytes),
            ResourceClass::Full => None,
        };
        let fetcher = self.fetcher.clone();
        let completions = self.completions.clone();
        let timeout = self.config.request_timeout();
        let task_url = url.clone();

        let handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(&task_url, class, budget)).await {
                Ok(result) => result,
                Err(_) => Err(Error::preload(task_url.as_str(), "request timed out")),
            };
            let _ = completions.send(FetchCompletion {
                url: task_url,
                ticket,
                result,
            });
        });

        debug!(%url, %class, ticket, "Preload started");
        self.in_flight.insert(url, InFlight { ticket, class, handle });
    }
}

impl Drop for PreloadScheduler {
    fn drop(&mut self) {
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
    }
}

/// Range-request fetcher over HTTP
#[cfg(feature = "http")]
pub struct HttpResourceFetcher {
    client: Client,
}

#[cfg(feature = "http")]
impl HttpResourceFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, url: &Url, class: ResourceClass, budget: Option<u64>) -> Result<TransferSample> {
        let started = tokio::time::Instant::now();
        let mut request = self.client.get(url.clone());
        if let Some(bytes) = budget.filter(|b| *b > 0) {
            request = request.header(reqwest::header::RANGE, format!("bytes=0-{}", bytes - 1));
        }

        let mut response = request.send().await?.error_for_status()?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await? {
            total += chunk.len() as u64;
            // Servers may ignore the range
            if budget.is_some_and(|limit| total >= limit) {
                break;
            }
        }

        Ok(TransferSample::new(total, started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Resolves each fetch only when the test releases it
    #[derive(Default)]
    struct GatedFetcher {
        started: Mutex<Vec<(Url, ResourceClass, Option<u64>)>>,
        gates: Mutex<HashMap<Url, tokio::sync::oneshot::Sender<Result<TransferSample>>>>,
    }

    impl GatedFetcher {
        fn started(&self) -> Vec<Url> {
            self.started.lock().iter().map(|(u, _, _)| u.clone()).collect()
        }

        fn release(&self, url: &Url, result: Result<TransferSample>) {
            if let Some(gate) = self.gates.lock().remove(url) {
                let _ = gate.send(result);
            }
        }
    }

    #[async_trait]
    impl ResourceFetcher for GatedFetcher {
        async fn fetch(&self, url: &Url, class: ResourceClass, budget: Option<u64>) -> Result<TransferSample> {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.started.lock().push((url.clone(), class, budget));
            self.gates.lock().insert(url.clone(), tx);
            rx.await.unwrap_or_else(|_| Err(Error::preload(url.as_str(), "gate dropped")))
        }
    }

    fn url(n: usize) -> Url {
        Url::parse(&format!("https://cdn.example.com/{n}.mp4")).unwrap()
    }

    fn scheduler(
        config: PreloadConfig,
    ) -> (PreloadScheduler, Arc<GatedFetcher>, mpsc::UnboundedReceiver<FetchCompletion>) {
        let fetcher = Arc::new(GatedFetcher::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (PreloadScheduler::new(config, fetcher.clone(), tx), fetcher, rx)
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn ok() -> Result<TransferSample> {
        Ok(TransferSample::new(65_536, Duration::from_millis(100)))
    }

    #[tokio::test]
    async fn test_reenqueue_updates_priority() {
        let (mut s, _fetcher, _rx) = scheduler(PreloadConfig::default());
        s.set_paused(true);

        assert!(s.enqueue(url(1), 3, ResourceClass::Metadata));
        assert!(s.enqueue(url(1), 9, ResourceClass::Metadata));
        assert_eq!(s.tasks().len(), 1);
        assert_eq!(s.tasks()[0].priority, 9);
        assert!(!s.enqueue(url(1), 9, ResourceClass::Metadata));
    }

    #[tokio::test]
    async fn test_order_is_priority_then_insertion() {
        let (mut s, _fetcher, _rx) = scheduler(PreloadConfig::default());
        s.set_paused(true);
        s.enqueue(url(1), 5, ResourceClass::Metadata);
        s.enqueue(url(2), 9, ResourceClass::Metadata);
        s.enqueue(url(3), 5, ResourceClass::Metadata);
        s.enqueue(url(1), 5, ResourceClass::Partial);

        let order: Vec<_> = s.tasks().iter().map(|t| t.url.clone()).collect();
        assert_eq!(order, vec![url(2), url(1), url(3)]);
        assert_eq!(s.task(&url(1)).unwrap().resource_class, ResourceClass::Partial);
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_cancel_frees_slot() {
        let (mut s, fetcher, _rx) = scheduler(PreloadConfig::default());
        s.enqueue(url(1), 9, ResourceClass::Full);
        s.enqueue(url(2), 8, ResourceClass::Full);
        s.enqueue(url(3), 7, ResourceClass::Full);
        settle().await;

        assert_eq!(s.in_flight(), 2);
        assert_eq!(s.status(&url(3)), Some(PreloadStatus::Pending));
        assert_eq!(fetcher.started(), vec![url(1), url(2)]);

        assert!(s.cancel(&url(1)));
        assert_eq!(s.in_flight(), 2);
        assert_eq!(s.status(&url(3)), Some(PreloadStatus::Loading));
        assert_eq!(s.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_loaded_only_after_fetch_resolves() {
        let (mut s, fetcher, mut rx) = scheduler(PreloadConfig::default());
        s.enqueue(url(1), 9, ResourceClass::Metadata);
        settle().await;
        assert_eq!(s.status(&url(1)), Some(PreloadStatus::Loading));
        assert!(rx.try_recv().is_err());

        fetcher.release(&url(1), ok());
        let completion = rx.recv().await.unwrap();
        let sample = s.handle_completion(completion).unwrap();
        assert_eq!(sample.bytes, 65_536);

        assert!(s.task(&url(1)).is_none());
        assert_eq!(s.status(&url(1)), Some(PreloadStatus::Loaded));
        assert!(!s.enqueue(url(1), 9, ResourceClass::Metadata));
        assert!(s.enqueue(url(1), 9, ResourceClass::Full));
    }

    #[tokio::test]
    async fn test_result_after_cancel_is_ignored() {
        let (mut s, _fetcher, _rx) = scheduler(PreloadConfig::default());
        s.enqueue(url(1), 9, ResourceClass::Metadata);
        settle().await;
        s.cancel(&url(1));

        let late = FetchCompletion { url: url(1), ticket: 0, result: ok() };
        assert!(s.handle_completion(late).is_none());
        assert_eq!(s.status(&url(1)), None);
        assert_eq!(s.stats().loaded, 0);
    }

    #[tokio::test]
    async fn test_failure_marks_error_and_proceeds() {
        let config = PreloadConfig { max_concurrent: 1, ..Default::default() };
        let (mut s, fetcher, mut rx) = scheduler(config);
        s.enqueue(url(1), 9, ResourceClass::Metadata);
        s.enqueue(url(2), 5, ResourceClass::Metadata);
        settle().await;

        fetcher.release(&url(1), Err(Error::preload(url(1).as_str(), "503")));
        let completion = rx.recv().await.unwrap();
        assert!(s.handle_completion(completion).is_none());

        assert_eq!(s.status(&url(1)), Some(PreloadStatus::Error));
        assert_eq!(s.status(&url(2)), Some(PreloadStatus::Loading));
        let stats = s.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.errored, 1);
    }

    #[tokio::test]
    async fn test_pause_halts_dequeue_without_clearing() {
        let (mut s, _fetcher, _rx) = scheduler(PreloadConfig::default());
        s.set_pause_reason(PauseReason::Power, true);
        s.enqueue(url(1), 9, ResourceClass::Full);
        assert_eq!(s.in_flight(), 0);

        s.handle_scroll_velocity(8.0);
        s.set_pause_reason(PauseReason::Power, false);
        assert!(s.is_paused());
        assert_eq!(s.in_flight(), 0);

        s.handle_scroll_velocity(0.5);
        assert!(!s.is_paused());
        assert_eq!(s.in_flight(), 1);
        assert_eq!(s.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_follows_resource_class() {
        let (mut s, fetcher, _rx) = scheduler(PreloadConfig::default());
        s.enqueue(url(1), 9, ResourceClass::Metadata);
        s.enqueue(url(2), 8, ResourceClass::Full);
        settle().await;

        let started = fetcher.started.lock().clone();
        assert_eq!(started[0].2, Some(64 * 1024));
        assert_eq!(started[1].2, None);
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let config = PreloadConfig { max_queue: 2, ..Default::default() };
        let (mut s, _fetcher, _rx) = scheduler(config);
        s.set_paused(true);
        s.enqueue(url(1), 5, ResourceClass::Metadata);
        s.enqueue(url(2), 9, ResourceClass::Metadata);
        assert!(!s.enqueue(url(3), 1, ResourceClass::Metadata));
        assert!(s.enqueue(url(4), 7, ResourceClass::Metadata));

        let urls: Vec<_> = s.tasks().iter().map(|t| t.url.clone()).collect();
        assert_eq!(urls, vec![url(2), url(4)]);
    }

    #[tokio::test]
    async fn test_retain_relevant() {
        let (mut s, _fetcher, _rx) = scheduler(PreloadConfig::default());
        s.enqueue(url(1), 9, ResourceClass::Full);
        s.enqueue(url(2), 8, ResourceClass::Full);
        s.enqueue(url(3), 7, ResourceClass::Full);
        settle().await;

        let keep: HashSet<Url> = [url(3)].into_iter().collect();
        assert_eq!(s.retain_relevant(&keep), 2);
        assert_eq!(s.tasks().len(), 1);
        assert_eq!(s.status(&url(3)), Some(PreloadStatus::Loading));
        assert_eq!(s.in_flight(), 1);
    }
}
