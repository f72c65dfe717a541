//! Scripted in-memory network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use tracing::trace;
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond(Response),
    Fail,
}

/// A [`Fetcher`] that answers from a routing table.
///
/// Unrouted URLs answer `404` as a reachable server would. Routes marked with
/// [`MockFetcher::fail`] and every URL while [offline](MockFetcher::set_offline)
/// fail at the transport level.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    offline: AtomicBool,
    calls: Mutex<Vec<Url>>,
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `response`.
    pub fn respond(&self, url: &Url, response: Response) -> &Self {
        lock(&self.routes).insert(route_key(url), Route::Respond(response));
        self
    }

    /// Answer `url` with a 200 carrying `body`.
    pub fn respond_ok(&self, url: &Url, body: impl Into<Bytes>) -> &Self {
        self.respond(url, Response::new(StatusCode::OK, body))
    }

    /// Make `url` fail at the transport level.
    pub fn fail(&self, url: &Url) -> &Self {
        lock(&self.routes).insert(route_key(url), Route::Fail);
        self
    }

    /// Toggle a total network outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches issued for `url`, including failed ones.
    pub fn call_count(&self, url: &Url) -> usize {
        let key = route_key(url);
        lock(&self.calls)
            .iter()
            .filter(|called| route_key(called) == key)
            .count()
    }

    /// Total number of fetches issued.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        lock(&self.calls).push(request.url.clone());

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %request.url, "Mock network offline");
            return Err(NetError::Offline);
        }

        let route = lock(&self.routes).get(&route_key(&request.url)).cloned();
        match route {
            Some(Route::Respond(response)) => Ok(response.with_url(request.url.clone())),
            Some(Route::Fail) => Err(NetError::RequestFailed(format!(
                "connection refused: {}",
                request.url
            ))),
            None => Ok(Response::empty(StatusCode::NOT_FOUND).with_url(request.url.clone())),
        }
    }
}
