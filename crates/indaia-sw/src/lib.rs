//! # Indaia Service Worker
//!
//! Offline caching worker for the Indaia fibre coverage map.
//!
//! ## Features
//!
//! - **Lifecycle**: install pre-caches the essential manifest, activate
//!   deletes superseded cache generations and claims open pages
//! - **Cache API**: named generations with `open`, `match`, `put`, `add_all`
//! - **Fetch interception**: per-resource strategies (cache first for static
//!   assets, network first for map tiles, offline fallbacks for geocoding)
//! - **Control channel**: `SKIP_WAITING`, `GET_CACHE_STATUS`, background sync hook
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker::dispatch(WorkerEvent)
//!     ├── Install / Activate ──→ LifecycleManager ──→ CacheStorage
//!     ├── Fetch ───────────────→ Router ──→ Classifier
//!     │                              ├──→ Fetcher (network)
//!     │                              └──→ CacheStorage
//!     ├── Message ─────────────→ SKIP_WAITING / GET_CACHE_STATUS
//!     └── Sync ────────────────→ BackgroundSync hook
//! ```

use indaia_common::IndaiaError;
use indaia_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod classify;
pub mod config;
pub mod control;
pub mod lifecycle;
pub mod router;
pub mod worker;

pub use cache::{Cache, CacheStorage, CachedResponse, RequestKey};
pub use classify::{Classifier, ResourceKind};
pub use config::WorkerConfig;
pub use control::{
    BackgroundSync, CacheStatus, ClientMessage, LoggingSync, MessageEvent, MessageOutcome,
    ReplyPort, SyncEvent, BACKGROUND_SYNC_TAG,
};
pub use lifecycle::{
    ActivateReport, Client, Clients, ExtendableEvent, InstallReport, LifecycleManager,
    ServiceWorker, ServiceWorkerId, ServiceWorkerState, WorkerRegistration,
};
pub use router::{FetchOutcome, OfflineAddress, Router, Strategy};
pub use worker::{EventKind, EventOutcome, OfflineWorker, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Response with status {0} is not cacheable")]
    UncacheableStatus(u16),

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Config(#[from] IndaiaError),

    #[error("Not found: {0}")]
    NotFound(String),
}
