//! Cache Storage: named generations of request/response pairs.
//!
//! ```text
//! CacheStorage (caches)
//!     ├── indaiafibra-static-v1.13.0 (Cache)
//!     │       └── RequestKey → CachedResponse
//!     └── indaiafibra-v1.13.0 (Cache)
//!             └── RequestKey → CachedResponse
//! ```
//!
//! Handles are cheap to clone and share the underlying storage. Each
//! generation is guarded by its own lock, so a put or match on one key is
//! atomic, but nothing spans several keys. Concurrent writers to one key race
//! and the last write wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use indaia_net::{Fetcher, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::classify::normalize;
use crate::ServiceWorkerError;

/// Cache lookup key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn for_url(url: &Url) -> Self {
        Self {
            method: Method::GET,
            url: normalize(url),
        }
    }

    /// Key for `request`. Only GET requests can be cached.
    pub fn from_request(request: &Request) -> Result<Self, ServiceWorkerError> {
        if !request.is_get() {
            return Err(ServiceWorkerError::UnsupportedMethod(
                request.method.to_string(),
            ));
        }
        Ok(Self::for_url(&request.url))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    response: Response,
    /// Stored at (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn into_response(self) -> Response {
        self.response
    }

    /// Bytes counted against the storage quota.
    pub fn size(&self) -> u64 {
        self.response.body().len() as u64
    }
}

/// Byte accounting shared by every generation of one storage.
#[derive(Debug, Default)]
struct Usage {
    used: AtomicU64,
    quota: Option<u64>,
}

impl Usage {
    /// Account for replacing `old` bytes with `new` bytes.
    fn reserve(&self, old: u64, new: u64) -> Result<(), ServiceWorkerError> {
        let quota = self.quota.unwrap_or(u64::MAX);
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let after = used.saturating_sub(old).saturating_add(new);
                (after <= quota).then_some(after)
            })
            .map(|_| ())
            .map_err(|used| ServiceWorkerError::QuotaExceeded {
                needed: new,
                available: quota.saturating_sub(used.saturating_sub(old)),
            })
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// One named cache generation.
#[derive(Debug, Clone)]
pub struct Cache {
    name: Arc<str>,
    entries: Arc<RwLock<HashMap<RequestKey, CachedResponse>>>,
    usage: Arc<Usage>,
}

impl Cache {
    fn new(name: &str, usage: Arc<Usage>) -> Self {
        Self {
            name: Arc::from(name),
            entries: Arc::new(RwLock::new(HashMap::new())),
            usage,
        }
    }

    /// Generation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request. Non-GET requests never match.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        let key = RequestKey::from_request(request).ok()?;
        self.entries.read().await.get(&key).cloned()
    }

    /// Match a GET of `url`.
    pub async fn match_url(&self, url: &Url) -> Option<CachedResponse> {
        self.entries
            .read()
            .await
            .get(&RequestKey::for_url(url))
            .cloned()
    }

    /// Store `response` for `request`.
    ///
    /// Only GET requests and `200 OK` responses are accepted.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        let key = RequestKey::from_request(request)?;
        if response.status != StatusCode::OK {
            return Err(ServiceWorkerError::UncacheableStatus(response.status.as_u16()));
        }

        let entry = CachedResponse::new(response);
        let mut entries = self.entries.write().await;
        let old = entries.get(&key).map(CachedResponse::size).unwrap_or_default();
        self.usage.reserve(old, entry.size())?;

        trace!(cache = %self.name, url = %key.url, bytes = entry.size(), "Cache put");
        entries.insert(key, entry);
        Ok(())
    }

    /// Fetch `request` and store the result.
    pub async fn add(&self, fetcher: &dyn Fetcher, request: Request) -> Result<(), ServiceWorkerError> {
        let response = fetch_cacheable(fetcher, &request).await?;
        self.put(&request, response).await
    }

    /// Fetch every request and store all of them, or none.
    ///
    /// Fails if any fetch fails or answers anything but `200 OK`. Requests
    /// for the same URL share one entry.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetcher,
        requests: Vec<Request>,
    ) -> Result<(), ServiceWorkerError> {
        for request in &requests {
            RequestKey::from_request(request)?;
        }

        let responses = join_all(requests.iter().map(|r| fetch_cacheable(fetcher, r))).await;

        // A repeated request is stored once; the last response wins.
        let mut batch = HashMap::with_capacity(requests.len());
        for (request, response) in requests.iter().zip(responses) {
            batch.insert(RequestKey::for_url(&request.url), CachedResponse::new(response?));
        }

        let mut entries = self.entries.write().await;
        let old: u64 = batch
            .iter()
            .filter_map(|(key, _)| entries.get(key).map(CachedResponse::size))
            .sum();
        let new: u64 = batch.iter().map(|(_, entry)| entry.size()).sum();
        self.usage.reserve(old, new)?;

        debug!(cache = %self.name, count = batch.len(), "Cache add_all stored batch");
        entries.extend(batch);
        Ok(())
    }

    /// Remove the entry for `request`.
    pub async fn delete(&self, request: &Request) -> bool {
        let Ok(key) = RequestKey::from_request(request) else {
            return false;
        };
        match self.entries.write().await.remove(&key) {
            Some(entry) => {
                self.usage.release(entry.size());
                true
            }
            None => false,
        }
    }

    /// All stored URLs.
    pub async fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .keys()
            .map(|k| k.url.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn total_size(&self) -> u64 {
        self.entries.read().await.values().map(CachedResponse::size).sum()
    }
}

async fn fetch_cacheable(fetcher: &dyn Fetcher, request: &Request) -> Result<Response, ServiceWorkerError> {
    let response = fetcher.fetch(request).await?;
    if response.status != StatusCode::OK {
        return Err(ServiceWorkerError::UncacheableStatus(response.status.as_u16()));
    }
    Ok(response)
}

/// Cache storage (the `caches` global).
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    generations: Arc<RwLock<Vec<Cache>>>,
    usage: Arc<Usage>,
    #[cfg(test)]
    removed_elsewhere: Arc<std::sync::Mutex<Vec<String>>>,
}

impl CacheStorage {
    /// Create an unbounded storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a storage that refuses writes beyond `bytes` of response bodies.
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            usage: Arc::new(Usage {
                used: AtomicU64::new(0),
                quota: Some(bytes),
            }),
            ..Self::default()
        }
    }

    /// Open a cache, creating it if absent.
    pub async fn open(&self, name: &str) -> Cache {
        let mut generations = self.generations.write().await;
        if let Some(cache) = generations.iter().find(|c| c.name() == name) {
            return cache.clone();
        }

        debug!(cache = name, "Creating cache generation");
        let cache = Cache::new(name, Arc::clone(&self.usage));
        generations.push(cache.clone());
        cache
    }

    /// Check if a generation exists.
    pub async fn has(&self, name: &str) -> bool {
        self.generations.read().await.iter().any(|c| c.name() == name)
    }

    /// Delete a generation and everything in it.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = {
            let mut generations = self.generations.write().await;
            #[cfg(test)]
            if self.take_removed_elsewhere(name) {
                generations.retain(|c| c.name() != name);
            }
            let index = generations.iter().position(|c| c.name() == name);
            index.map(|i| generations.remove(i))
        };

        match removed {
            Some(cache) => {
                self.usage.release(cache.total_size().await);
                true
            }
            None => false,
        }
    }

    /// Generation names in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.generations
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Match across every generation, oldest first.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        let generations = self.generations.read().await.clone();
        for cache in generations {
            if let Some(entry) = cache.match_request(request).await {
                return Some(entry);
            }
        }
        None
    }

    /// Match a GET of `url` across every generation.
    pub async fn match_url(&self, url: &Url) -> Option<CachedResponse> {
        let generations = self.generations.read().await.clone();
        for cache in generations {
            if let Some(entry) = cache.match_url(url).await {
                return Some(entry);
            }
        }
        None
    }

    /// Bytes of response bodies currently stored.
    pub fn usage(&self) -> u64 {
        self.usage.used.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CacheStorage {
    /// Make the next `delete(name)` find the generation already gone, as if
    /// another worker sharing this storage removed it first.
    pub(crate) fn remove_before_next_delete(&self, name: &str) {
        self.removed_elsewhere
            .lock()
            .unwrap()
            .push(name.to_string());
    }

    fn take_removed_elsewhere(&self, name: &str) -> bool {
        let mut names = self.removed_elsewhere.lock().unwrap();
        match names.iter().position(|n| n == name) {
            Some(i) => {
                names.remove(i);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indaia_net::MockFetcher;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::OK, body)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let storage = CacheStorage::new();
        storage.open("v1").await;
        storage.open("v1").await;
        storage.open("v2").await;
        assert_eq!(storage.keys().await, vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = CacheStorage::new();
        let cache = storage.open("v1").await;
        let request = Request::get(url("https://example.com/style.css"));

        cache.put(&request, ok("body{}")).await.unwrap();

        let hit = cache.match_request(&request).await.unwrap();
        assert_eq!(hit.response().text().unwrap(), "body{}");
        assert!(cache
            .match_url(&url("https://example.com/style.css#top"))
            .await
            .is_some());
        assert!(cache
            .match_url(&url("https://example.com/other.css"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_non_get_and_non_200() {
        let cache = CacheStorage::new().open("v1").await;
        let target = url("https://example.com/submit");

        let post = Request::post(target.clone(), "x".into());
        assert!(matches!(
            cache.put(&post, ok("x")).await,
            Err(ServiceWorkerError::UnsupportedMethod(_))
        ));

        let partial = Response::new(StatusCode::PARTIAL_CONTENT, "x");
        assert!(matches!(
            cache.put(&Request::get(target), partial).await,
            Err(ServiceWorkerError::UncacheableStatus(206))
        ));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_all_is_atomic() {
        let fetcher = MockFetcher::new();
        let a = url("https://example.com/a.js");
        let b = url("https://example.com/b.js");
        fetcher.respond_ok(&a, "a");
        fetcher.fail(&b);

        let cache = CacheStorage::new().open("v1").await;
        let result = cache
            .add_all(&fetcher, vec![Request::get(a.clone()), Request::get(b)])
            .await;

        assert!(result.is_err());
        assert!(cache.is_empty().await);

        cache.add(&fetcher, Request::get(a)).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_all_counts_repeated_url_once() {
        let fetcher = MockFetcher::new();
        let page = url("https://example.com/index.html");
        fetcher.respond_ok(&page, "<html></html>");

        let storage = CacheStorage::new();
        let cache = storage.open("v1").await;
        cache
            .add_all(
                &fetcher,
                vec![
                    Request::get(page.clone()),
                    Request::get(url("https://example.com/index.html#map")),
                ],
            )
            .await
            .unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(storage.usage(), 13);

        assert!(storage.delete("v1").await);
        assert_eq!(storage.usage(), 0);
    }

    #[tokio::test]
    async fn test_add_all_repeated_url_fits_quota() {
        let fetcher = MockFetcher::new();
        let script = url("https://example.com/app.js");
        fetcher.respond_ok(&script, "abcd");

        let storage = CacheStorage::with_quota(4);
        let cache = storage.open("v1").await;
        cache
            .add_all(&fetcher, vec![Request::get(script.clone()), Request::get(script)])
            .await
            .unwrap();
        assert_eq!(storage.usage(), 4);
    }

    #[tokio::test]
    async fn test_add_rejects_error_status() {
        let fetcher = MockFetcher::new();
        let cache = CacheStorage::new().open("v1").await;
        let missing = Request::get(url("https://example.com/missing.js"));
        assert!(matches!(
            cache.add(&fetcher, missing).await,
            Err(ServiceWorkerError::UncacheableStatus(404))
        ));
    }

    #[tokio::test]
    async fn test_delete_generation() {
        let storage = CacheStorage::new();
        let cache = storage.open("old").await;
        cache
            .put(&Request::get(url("https://example.com/x.png")), ok("png"))
            .await
            .unwrap();
        assert_eq!(storage.usage(), 3);

        assert!(storage.delete("old").await);
        assert!(!storage.has("old").await);
        assert!(!storage.delete("old").await);
        assert_eq!(storage.usage(), 0);
    }

    #[tokio::test]
    async fn test_storage_match_searches_all_generations() {
        let storage = CacheStorage::new();
        let tile = url("https://tiles.example.com/1/2/3.png");
        storage
            .open("tiles")
            .await
            .put(&Request::get(tile.clone()), ok("tile"))
            .await
            .unwrap();
        storage.open("static").await;

        let hit = storage.match_url(&tile).await.unwrap();
        assert_eq!(hit.response().body().as_ref(), b"tile");
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let storage = CacheStorage::with_quota(4);
        let cache = storage.open("v1").await;
        let a = Request::get(url("https://example.com/a.css"));
        let b = Request::get(url("https://example.com/b.css"));

        cache.put(&a, ok("abc")).await.unwrap();
        assert!(matches!(
            cache.put(&b, ok("defg")).await,
            Err(ServiceWorkerError::QuotaExceeded { needed: 4, available: 1 })
        ));

        // Replacing an entry only counts the difference.
        cache.put(&a, ok("abcd")).await.unwrap();
        assert_eq!(storage.usage(), 4);
    }
}
