//! Worker configuration and resource manifest.
//!
//! The configuration is read once at startup and shared read-only for the
//! lifetime of the worker. Bumping [`WorkerConfig::version`] renames both
//! cache generations, which makes the next activation delete the old ones.

use std::path::Path;

use indaia_common::{IndaiaError, Result, ResultExt};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::classify::normalize;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix shared by every cache generation name.
    pub app_name: String,

    /// Release version stamped into generation names.
    pub version: String,

    /// Origin (and scope) of the controlled page.
    pub origin: Url,

    /// Path of the worker script, relative to `origin`.
    pub script_path: String,

    /// Resources pre-cached at install. Relative entries resolve against `origin`.
    pub essential: Vec<String>,

    /// Resources that are never fetched proactively.
    pub optional: Vec<String>,

    /// Host of the reverse-geocoding API.
    pub geocoding_host: String,

    /// Document served for failed navigations.
    pub offline_document: String,

    /// Host substrings of CDNs and font hosts whose content never changes.
    pub static_hosts: Vec<String>,

    /// Path suffixes of static assets.
    pub static_extensions: Vec<String>,

    /// Host substrings of map tile providers.
    pub tile_hosts: Vec<String>,

    /// Path fragments that identify tile requests.
    pub tile_path_markers: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            app_name: "indaiafibra".to_string(),
            version: "1.13.0".to_string(),
            origin: Url::parse("https://indaiafibra.com.br/").expect("default origin is valid"),
            script_path: "/sw.js".to_string(),
            essential: strings(&[
                "/",
                "/index.html",
                "/manifest.json",
                "https://cdn.jsdelivr.net/npm/tailwindcss@2.2.19/dist/tailwind.min.css",
                "https://unpkg.com/aos@2.3.1/dist/aos.css",
                "https://cdn.jsdelivr.net/npm/leaflet@1.9.4/dist/leaflet.css",
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.4.0/css/all.min.css",
                "https://fonts.googleapis.com/css2?family=Inter:wght@400;600&display=swap",
                "https://cdn.jsdelivr.net/npm/leaflet@1.9.4/dist/leaflet.js",
                "https://unpkg.com/aos@2.3.1/dist/aos.js",
                "https://img.icons8.com/?size=2x&id=Sd1fJXRt5uTd&format=png",
                "https://unpkg.com/leaflet@1.9.4/dist/images/marker-icon.png",
                "https://unpkg.com/leaflet@1.9.4/dist/images/marker-shadow.png",
            ]),
            optional: strings(&[
                "https://cartodb-basemaps-a.global.ssl.fastly.net/light_all/",
                "https://cartodb-basemaps-b.global.ssl.fastly.net/light_all/",
                "https://cartodb-basemaps-c.global.ssl.fastly.net/light_all/",
                "https://cartodb-basemaps-d.global.ssl.fastly.net/light_all/",
            ]),
            geocoding_host: "nominatim.openstreetmap.org".to_string(),
            offline_document: "/index.html".to_string(),
            static_hosts: strings(&[
                "fonts.googleapis.com",
                "cdnjs.cloudflare.com",
                "unpkg.com",
                "cdn.jsdelivr.net",
            ]),
            static_extensions: strings(&[".css", ".js", ".png", ".jpg", ".svg"]),
            tile_hosts: strings(&["cartodb-basemaps", "openstreetmap.org"]),
            tile_path_markers: strings(&["/tiles/"]),
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| IndaiaError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .context(format!("reading worker config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// Check that generation names can be built and every manifest entry
    /// resolves to a distinct URL.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(IndaiaError::config("app_name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(IndaiaError::config("version must not be empty"));
        }
        if self.geocoding_host.trim().is_empty() {
            return Err(IndaiaError::config("geocoding_host must not be empty"));
        }
        if self.static_cache_name() == self.dynamic_cache_name() {
            return Err(IndaiaError::config("cache generation names collide"));
        }
        let mut seen = HashSet::new();
        for (entry, url) in self.essential.iter().zip(self.essential_urls()?) {
            if !seen.insert(normalize(&url)) {
                return Err(IndaiaError::manifest(entry.as_str(), "listed more than once"));
            }
        }
        self.optional_urls()?;
        self.offline_document_url()?;
        self.script_url()?;
        Ok(())
    }

    /// Name of the generation holding essential and static assets.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-v{}", self.app_name, self.version)
    }

    /// Name of the generation holding map tiles.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-v{}", self.app_name, self.version)
    }

    /// Both generation names that survive activation.
    pub fn current_cache_names(&self) -> [String; 2] {
        [self.dynamic_cache_name(), self.static_cache_name()]
    }

    /// Resolve a manifest entry against the page origin.
    pub fn resolve(&self, entry: &str) -> Result<Url> {
        self.origin
            .join(entry)
            .map_err(|e| IndaiaError::manifest(entry, e))
    }

    /// Absolute URLs of the essential manifest, in manifest order.
    pub fn essential_urls(&self) -> Result<Vec<Url>> {
        self.essential.iter().map(|e| self.resolve(e)).collect()
    }

    /// Absolute URLs of the optional manifest.
    pub fn optional_urls(&self) -> Result<Vec<Url>> {
        self.optional.iter().map(|e| self.resolve(e)).collect()
    }

    pub fn offline_document_url(&self) -> Result<Url> {
        self.resolve(&self.offline_document)
    }

    pub fn script_url(&self) -> Result<Url> {
        self.resolve(&self.script_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generation_names() {
        let config = WorkerConfig::default();
        assert_eq!(config.static_cache_name(), "indaiafibra-static-v1.13.0");
        assert_eq!(config.dynamic_cache_name(), "indaiafibra-v1.13.0");
    }

    #[test]
    fn test_default_is_valid() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_relative_entries_resolve_against_origin() {
        let config = WorkerConfig::default();
        let urls = config.essential_urls().unwrap();
        assert_eq!(urls.len(), config.essential.len());
        assert_eq!(urls[0].as_str(), "https://indaiafibra.com.br/");
        assert_eq!(urls[1].as_str(), "https://indaiafibra.com.br/index.html");
        assert_eq!(urls[3].host_str(), Some("cdn.jsdelivr.net"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = WorkerConfig::from_json_str(r#"{"version": "2.0.0"}"#).unwrap();
        assert_eq!(config.static_cache_name(), "indaiafibra-static-v2.0.0");
        assert_eq!(config.essential, WorkerConfig::default().essential);
    }

    #[test]
    fn test_rejects_empty_version() {
        let err = WorkerConfig::from_json_str(r#"{"version": " "}"#).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = WorkerConfig::from_json_str("{version").unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"app_name": "mapa", "origin": "http://localhost:8080/"}}"#).unwrap();

        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dynamic_cache_name(), "mapa-v1.13.0");
        assert_eq!(
            config.offline_document_url().unwrap().as_str(),
            "http://localhost:8080/index.html"
        );
    }

    #[test]
    fn test_missing_file() {
        let err = WorkerConfig::from_file("/nonexistent/worker.json").unwrap_err();
        assert_eq!(err.category(), "io");
        assert!(err.to_string().contains("reading worker config"));
    }

    #[test]
    fn test_rejects_duplicate_essential_entries() {
        // "/index.html" and its absolute form name the same resource.
        let config = WorkerConfig {
            essential: vec![
                "/index.html".to_string(),
                "https://indaiafibra.com.br/index.html#top".to_string(),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            IndaiaError::Manifest { ref entry, .. } if entry == "https://indaiafibra.com.br/index.html#top"
        ));
    }

    #[test]
    fn test_rejects_unresolvable_entry() {
        let err = WorkerConfig::from_json_str(r#"{"essential": ["http://[::1"]}"#).unwrap_err();
        assert_eq!(err.category(), "manifest");
    }
}
