//! Control channel between controlled pages and the worker.
//!
//! Pages post JSON messages tagged by `type`:
//!
//! - `SKIP_WAITING`: activate the waiting worker now
//! - `GET_CACHE_STATUS`: reply on the first transferred port with the
//!   generation names and whether the static generation exists
//!
//! The `background-sync` sync tag is accepted and forwarded to a
//! [`BackgroundSync`] hook. The default hook only logs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::ServiceWorkerError;

/// Sync tag registered by the page for deferred work.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Message a controlled page can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SkipWaiting,
    GetCacheStatus,
}

impl ClientMessage {
    /// Decode message data. Anything that is not a known message is `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        match serde_json::from_value(data.clone()) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized message");
                None
            }
        }
    }
}

/// Reply to `GET_CACHE_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub caches: Vec<String>,
    pub is_offline_ready: bool,
}

impl CacheStatus {
    /// Snapshot the generation names in `caches`.
    pub async fn collect(caches: &CacheStorage, config: &WorkerConfig) -> Self {
        let names = caches.keys().await;
        let is_offline_ready = names.contains(&config.static_cache_name());
        Self {
            caches: names,
            is_offline_ready,
        }
    }
}

/// Sending half of a page's private `MessageChannel`.
#[derive(Debug, Clone)]
pub struct ReplyPort {
    tx: mpsc::UnboundedSender<JsonValue>,
}

impl ReplyPort {
    /// Create a port and the page-side receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JsonValue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn post_message(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(data)
            .map_err(|_| ServiceWorkerError::StateError("reply port closed".to_string()))
    }
}

/// A `message` event.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: JsonValue,
    pub ports: Vec<ReplyPort>,
}

impl MessageEvent {
    pub fn new(data: JsonValue) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: ReplyPort) -> Self {
        self.ports.push(port);
        self
    }
}

/// How a message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Skip-waiting requested; `activated` tells whether a waiting worker took over.
    SkipWaiting { activated: bool },
    /// Status sent on the reply port.
    CacheStatus(CacheStatus),
    /// Unknown or malformed message.
    Ignored,
}

/// A `sync` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub tag: String,
    /// Whether the platform will not retry this sync again.
    pub last_chance: bool,
}

impl SyncEvent {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            last_chance: false,
        }
    }
}

/// Extension point for deferred synchronization once connectivity returns.
#[async_trait]
pub trait BackgroundSync: Send + Sync {
    async fn sync(&self, event: &SyncEvent) -> Result<(), ServiceWorkerError>;
}

/// Default hook: there is no pending work to replay yet, so it only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSync;

#[async_trait]
impl BackgroundSync for LoggingSync {
    async fn sync(&self, event: &SyncEvent) -> Result<(), ServiceWorkerError> {
        info!(tag = %event.tag, last_chance = event.last_chance, "Background sync");
        Ok(())
    }
}
