//! Resource classification.
//!
//! Decides which caching strategy a URL belongs to. Everything here is pure:
//! no network, no cache.

use std::sync::OnceLock;

use hashbrown::HashSet;
use indaia_common::Result;
use regex::Regex;
use url::Url;

use crate::config::WorkerConfig;

/// Tile template as written in map library configs, raw and percent-encoded.
const TILE_TEMPLATES: [&str; 2] = ["/{z}/{x}/{y}", "/%7Bz%7D/%7Bx%7D/%7By%7D"];

fn tile_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/\d+/\d+/\d+\.png").expect("tile pattern is valid"))
}

/// Key used to compare URLs: the full URL without its fragment.
pub(crate) fn normalize(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Resource classes, in routing precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Reverse-geocoding API call.
    Geocoding,
    /// Content-addressed asset (manifest entry, CDN, font, script, style, image).
    Static,
    /// Map tile image.
    MapTile,
    /// Anything else.
    Other,
}

/// URL classifier built once from the worker configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
    essential: HashSet<String>,
    geocoding_host: String,
    static_hosts: Vec<String>,
    static_extensions: Vec<String>,
    tile_hosts: Vec<String>,
    tile_path_markers: Vec<String>,
}

impl Classifier {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let essential = config
            .essential_urls()?
            .iter()
            .map(normalize)
            .collect();

        Ok(Self {
            essential,
            geocoding_host: config.geocoding_host.to_ascii_lowercase(),
            static_hosts: config.static_hosts.clone(),
            static_extensions: config
                .static_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            tile_hosts: config.tile_hosts.clone(),
            tile_path_markers: config.tile_path_markers.clone(),
        })
    }

    /// Whether `url` targets the reverse-geocoding API.
    pub fn is_geocoding(&self, url: &Url) -> bool {
        url.host_str() == Some(self.geocoding_host.as_str())
    }

    /// Whether `url` is an essential entry, lives on a static host, or has a
    /// static file extension.
    ///
    /// The extension rule does not apply to tile-shaped URLs, so a tile image
    /// is not claimed just because it ends in `.png`. The manifest and host
    /// rules still apply to them.
    pub fn is_static_resource(&self, url: &Url) -> bool {
        if self.essential.contains(&normalize(url)) {
            return true;
        }

        let host = url.host_str().unwrap_or_default();
        if self.static_hosts.iter().any(|h| host.contains(h.as_str())) {
            return true;
        }

        let path = url.path().to_ascii_lowercase();
        self.static_extensions
            .iter()
            .any(|ext| path.ends_with(ext.as_str()))
            && !self.is_map_tile(url)
    }

    /// Whether `url` is a map tile: a tile provider host, a tile path marker,
    /// a `{z}/{x}/{y}` template, or a numeric `/<z>/<x>/<y>.png` path.
    pub fn is_map_tile(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default();
        if self.tile_hosts.iter().any(|h| host.contains(h.as_str())) {
            return true;
        }

        let path = url.path();
        if self
            .tile_path_markers
            .iter()
            .any(|marker| path.contains(marker.as_str()))
        {
            return true;
        }

        TILE_TEMPLATES.iter().any(|t| path.contains(t)) || tile_path_pattern().is_match(path)
    }

    /// Classify `url`. First match wins: geocoding, static, tile, other.
    pub fn classify(&self, url: &Url) -> ResourceKind {
        if self.is_geocoding(url) {
            ResourceKind::Geocoding
        } else if self.is_static_resource(url) {
            ResourceKind::Static
        } else if self.is_map_tile(url) {
            ResourceKind::MapTile
        } else {
            ResourceKind::Other
        }
    }
}
