//! Manifest loading for the manifest-parsing engine

use crate::types::QualityLevel;
use crate::Result;
use async_trait::async_trait;
use url::Url;

#[cfg(feature = "hls")]
use crate::Error;
#[cfg(feature = "hls")]
use m3u8_rs::Playlist;
#[cfg(feature = "hls")]
use reqwest::Client;
#[cfg(feature = "hls")]
use std::time::Duration;
#[cfg(feature = "hls")]
use tracing::{debug, instrument};

/// Resolves the quality ladder of an adaptive source
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Quality levels ordered by bitrate; empty for single-variant sources
    async fn load_levels(&self, url: &Url) -> Result<Vec<QualityLevel>>;
}

/// HLS master playlist loader
#[cfg(feature = "hls")]
pub struct HlsManifestLoader {
    client: Client,
}

#[cfg(feature = "hls")]
impl HlsManifestLoader {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Parse a playlist body into a quality ladder
    pub fn parse_levels(content: &[u8]) -> Result<Vec<QualityLevel>> {
        let playlist = m3u8_rs::parse_playlist_res(content)
            .map_err(|e| Error::ManifestParse(format!("Failed to parse HLS playlist: {:?}", e)))?;

        let master = match playlist {
            Playlist::MasterPlaylist(master) => master,
            // Single rendition; the pipeline adapts on its own
            Playlist::MediaPlaylist(_) => return Ok(Vec::new()),
        };

        let mut levels: Vec<QualityLevel> = master
            .variants
            .iter()
            .filter(|variant| !variant.is_i_frame)
            .map(|variant| {
                let height = variant.resolution.as_ref().map(|r| r.height as u32).unwrap_or(0);
                QualityLevel::new(height, variant.bandwidth)
            })
            .collect();

        levels.sort_by_key(|level| level.bitrate_bps);
        levels.dedup();
        Ok(levels)
    }
}

#[cfg(feature = "hls")]
#[async_trait]
impl ManifestLoader for HlsManifestLoader {
    #[instrument(skip(self))]
    async fn load_levels(&self, url: &Url) -> Result<Vec<QualityLevel>> {
        debug!("Fetching HLS manifest: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;

        let content = response
            .bytes()
            .await
            .map_err(|e| Error::ManifestFetch(e.to_string()))?;

        let levels = Self::parse_levels(&content)?;
        debug!(levels = levels.len(), "Quality ladder resolved");
        Ok(levels)
    }
}
