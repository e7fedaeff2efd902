//! URL-template tile source over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{FetchError, ValidationError};

use super::grid::flip_row;
use super::identity::TileIdentity;
use super::source::TileSource;

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default User-Agent string for HTTP requests.
/// Some tile servers reject requests without one.
const DEFAULT_USER_AGENT: &str = concat!("tile-mosaic/", env!("CARGO_PKG_VERSION"));

const REQUIRED_PLACEHOLDERS: [&str; 3] = ["{z}", "{x}", "{y}"];

/// Fetches tiles from a `{z}/{x}/{y}` URL template.
///
/// `{y}` is substituted with the top-origin (XYZ) row that slippy-map
/// servers expect, and `{date}` with the tile's date (or an empty string).
///
/// # Example
///
/// ```ignore
/// let source = HttpTileSource::new(
///     "osm",
///     "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
///     19,
/// )?;
/// ```
#[derive(Clone)]
pub struct HttpTileSource {
    name: String,
    template: String,
    max_zoom: u8,
    tile_size: u32,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTileSource {
    /// Create a source with the default timeout and tile size.
    pub fn new(name: &str, template: &str, max_zoom: u8) -> Result<Self, ValidationError> {
        Self::with_timeout(
            name,
            template,
            max_zoom,
            Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        )
    }

    /// Create a source with a custom per-request timeout.
    pub fn with_timeout(
        name: &str,
        template: &str,
        max_zoom: u8,
        timeout: Duration,
    ) -> Result<Self, ValidationError> {
        for placeholder in REQUIRED_PLACEHOLDERS {
            if !template.contains(placeholder) {
                return Err(ValidationError::InvalidTemplate {
                    template: template.to_string(),
                    placeholder,
                });
            }
        }

        // Only fails when the TLS backend cannot be initialized
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| ValidationError::HttpClient(e.to_string()))?;

        Ok(Self {
            name: name.trim().to_lowercase(),
            template: template.to_string(),
            max_zoom,
            tile_size: super::source::DEFAULT_TILE_SIZE,
            client,
            timeout,
        })
    }

    /// Override the advertised tile size.
    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    /// Expand the URL template for one tile.
    pub fn url_for(&self, tile: &TileIdentity) -> String {
        self.template
            .replace("{z}", &tile.z().to_string())
            .replace("{x}", &tile.x().to_string())
            .replace("{y}", &flip_row(tile.z(), tile.y()).to_string())
            .replace("{date}", tile.date().unwrap_or(""))
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    async fn fetch_tile(&self, tile: &TileIdentity) -> Result<Bytes, FetchError> {
        let url = self.url_for(tile);
        trace!(url = %url, "HTTP GET request starting");

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Err(FetchError::Timeout(self.timeout.as_millis() as u64));
            }
            Err(e) => {
                warn!(
                    url = %url,
                    error = %e,
                    is_connect = e.is_connect(),
                    "HTTP request failed"
                );
                return Err(FetchError::Connection(e.to_string()));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(tile.key()));
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url,
            });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout.as_millis() as u64)
            } else {
                FetchError::Connection(e.to_string())
            }
        })?;

        if bytes.is_empty() {
            return Err(FetchError::EmptyResponse(tile.key()));
        }

        debug!(url = %url, bytes = bytes.len(), "Tile fetched");
        Ok(bytes)
    }
}
