//! Request routing and caching strategies.
//!
//! | Class     | Strategy                                  | Write-back        |
//! |-----------|-------------------------------------------|-------------------|
//! | Geocoding | network, synthetic JSON when offline      | none              |
//! | Static    | cache first, network on miss              | static generation |
//! | Map tile  | network first, cache, synthetic 404       | dynamic generation|
//! | Other     | network first, cache on transport failure | none              |
//!
//! Write-backs run on the current tokio runtime and never delay the response.
//! Without a runtime (a host driving the worker with another executor) they
//! are written before the response is returned.

use std::sync::{Arc, Mutex, MutexGuard};

use http::StatusCode;
use indaia_net::{Fetcher, NetError, Request, RequestDestination, Response};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::cache::CacheStorage;
use crate::classify::{Classifier, ResourceKind};
use crate::config::WorkerConfig;
use crate::ServiceWorkerError;

/// Body returned for reverse-geocoding calls while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineAddress {
    pub address: AddressFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressFields {
    pub road: String,
    pub house_number: String,
}

impl Default for OfflineAddress {
    fn default() -> Self {
        Self {
            address: AddressFields {
                road: "Offline".to_string(),
                house_number: "s/n".to_string(),
            },
        }
    }
}

/// Caching strategy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    GeocodingPassthrough,
    CacheFirst,
    NetworkFirst,
    NetworkWithCacheFallback,
}

impl From<ResourceKind> for Strategy {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Geocoding => Strategy::GeocodingPassthrough,
            ResourceKind::Static => Strategy::CacheFirst,
            ResourceKind::MapTile => Strategy::NetworkFirst,
            ResourceKind::Other => Strategy::NetworkWithCacheFallback,
        }
    }
}

/// What the worker does with an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the page's request proceeds untouched.
    Unhandled,
    /// Respond with this response.
    Respond(Response),
    /// Respond with a network error; the page sees a failed fetch.
    NetworkError(ServiceWorkerError),
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, FetchOutcome::Unhandled)
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, FetchOutcome::NetworkError(_))
    }
}

/// Per-request strategy engine.
pub struct Router {
    config: Arc<WorkerConfig>,
    classifier: Classifier,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    writes: Mutex<JoinSet<()>>,
}

impl Router {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let classifier = Classifier::new(&config)?;
        Ok(Self {
            config,
            classifier,
            caches,
            fetcher,
            writes: Mutex::new(JoinSet::new()),
        })
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Strategy the router would apply to `request`, or `None` for non-GET.
    pub fn strategy_for(&self, request: &Request) -> Option<Strategy> {
        request
            .is_get()
            .then(|| self.classifier.classify(&request.url).into())
    }

    /// Handle an intercepted request.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        let Some(strategy) = self.strategy_for(request) else {
            trace!(url = %request.url, method = %request.method, "Passing through non-GET request");
            return FetchOutcome::Unhandled;
        };

        debug!(url = %request.url, ?strategy, "Routing request");
        let result = match strategy {
            Strategy::GeocodingPassthrough => self.geocoding(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::NetworkWithCacheFallback => self.network_with_cache_fallback(request).await,
        };

        match result {
            Ok(response) => FetchOutcome::Respond(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Request failed");
                FetchOutcome::NetworkError(e)
            }
        }
    }

    async fn geocoding(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Geocoding offline, answering placeholder address");
                Ok(Response::json(&OfflineAddress::default())?)
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        if let Some(hit) = self.caches.match_request(request).await {
            trace!(url = %request.url, "Cache hit");
            return Ok(hit.into_response());
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.store_in_background(self.config.static_cache_name(), request, &response)
                        .await;
                }
                Ok(response)
            }
            Err(e) if request.destination == RequestDestination::Document => {
                let document = self.config.offline_document_url()?;
                match self.caches.match_url(&document).await {
                    Some(hit) => {
                        warn!(url = %request.url, "Navigation offline, serving cached document");
                        Ok(hit.into_response())
                    }
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.store_in_background(self.config.dynamic_cache_name(), request, &response)
                        .await;
                }
                Ok(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Tile fetch failed, trying cache");
                Ok(match self.caches.match_request(request).await {
                    Some(hit) => hit.into_response(),
                    None => Response::empty(StatusCode::NOT_FOUND),
                })
            }
        }
    }

    async fn network_with_cache_fallback(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let error: NetError = match self.fetcher.fetch(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        match self.caches.match_request(request).await {
            Some(hit) => Ok(hit.into_response()),
            None => Err(error.into()),
        }
    }

    /// Store a copy of `response`. Failures are dropped.
    ///
    /// On a tokio runtime the write is spawned and this returns at once.
    async fn store_in_background(&self, cache_name: String, request: &Request, response: &Response) {
        let caches = self.caches.clone();
        let request = request.clone();
        let response = response.clone();
        let write = async move {
            let cache = caches.open(&cache_name).await;
            if let Err(e) = cache.put(&request, response).await {
                debug!(cache = %cache_name, url = %request.url, error = %e, "Dropped cache write");
            }
        };

        match Handle::try_current() {
            Ok(handle) => {
                let mut writes = self.writes();
                while writes.try_join_next().is_some() {}
                writes.spawn_on(write, &handle);
            }
            Err(_) => {
                trace!("No tokio runtime, writing to cache inline");
                write.await;
            }
        }
    }

    /// Wait for every background write issued so far.
    pub async fn flush_writes(&self) {
        let mut pending = std::mem::take(&mut *self.writes());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }

    fn writes(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }
}
