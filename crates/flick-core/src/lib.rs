//! Flick Core - Playback pooling for short-form video feeds
//!
//! This crate keeps a small, fixed set of playback engines mapped onto a
//! much larger swipeable feed:
//! - Validated playback state machine with stall detection
//! - Two interchangeable stream engines with local error recovery
//! - Playback controllers with autoplay fallback and auto-pause policies
//! - Distance-based engine pool and preload scheduling
//! - Memory governance for render surfaces and decoded frames
//! - Network and power monitoring
//! - Per-session analytics with a QoE score
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Feed                                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Network    │  │    Power     │  │   Memory     │           │
//! │  │   Monitor    │  │   Monitor    │  │  Governor    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐        ┌──────────────┐      │
//! │                    │ Engine Pool │───────▶│   Preload    │      │
//! │                    └──────┬──────┘        │  Scheduler   │      │
//! │                           │               └──────────────┘      │
//! │         ┌─────────────────┼─────────────────┐                   │
//! │  ┌──────┴───────┐  ┌──────┴───────┐  ┌──────┴───────┐           │
//! │  │  Controller  │  │  Controller  │  │  Controller  │  ...      │
//! │  │ state machine│  │ state machine│  │ state machine│           │
//! │  │    engine    │  │    engine    │  │    engine    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod state_machine;
pub mod session;
pub mod preferences;
pub mod analytics;
pub mod network;
pub mod power;
pub mod engine;
pub mod headless;
pub mod policy;
pub mod events;
pub mod controller;
pub mod preload;
pub mod memory;
pub mod pool;
pub mod feed;
pub mod runtime;

pub use error::{Error, ErrorSeverity, Result, StreamError, StreamErrorKind};
pub use types::*;
pub use config::FlickConfig;
pub use state_machine::{PlaybackStateMachine, StateChange};
pub use session::{PlaybackSession, SessionSnapshot};
pub use preferences::{MemoryPreferenceStore, PlaybackPreferences, PreferenceStore};
pub use analytics::{AnalyticsEvent, AnalyticsSnapshot, AnalyticsTracker};
pub use network::{BufferRecommendation, NetworkInfo, NetworkMonitor, NetworkProbe, NetworkSample};
pub use power::{PowerInfo, PowerMonitor, PowerProbe, PowerSample};
pub use engine::{EngineKind, MediaSurface, PlatformCapabilities, StreamEngine, SurfaceFactory};
pub use events::{FeedCommand, FeedEvent, Intent, PlayOutcome};
pub use controller::PlaybackController;
pub use preload::{PreloadScheduler, PreloadTask, ResourceFetcher};
pub use memory::{DisposeAction, DisposeOrder, MemoryGovernor, ResidencyEntry};
pub use pool::{preload_priority, EnginePool, PreloadPriority};
pub use feed::{Feed, FeedDeps, FeedStats};
pub use runtime::{FeedHandle, FeedRuntime};

#[cfg(feature = "hls")]
pub use engine::HlsManifestLoader;
#[cfg(feature = "http")]
pub use preload::HttpResourceFetcher;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library
pub fn init() {
    tracing::info!(version = VERSION, "Flick Core initialized");
}
