//! # Indaia Net
//!
//! Request/response model and network access for the Indaia offline worker.
//!
//! ## Design Goals
//!
//! 1. **Fetch semantics**: a non-2xx status is a response, not an error;
//!    only transport failures surface as [`NetError`]
//! 2. **Pluggable network**: the worker talks to a [`Fetcher`], so strategies
//!    can run against [`HttpFetcher`] in production and [`MockFetcher`] in tests
//! 3. **Cheap clones**: bodies are [`Bytes`], so storing a copy of a response
//!    never re-reads the network

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod mock;

pub use mock::MockFetcher;

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, mirroring the platform's `Request.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Cross-origin requests allowed with CORS headers.
    #[default]
    Cors,
    /// Opaque cross-origin requests.
    NoCors,
    /// Same-origin only.
    SameOrigin,
    /// Top-level navigation.
    Navigate,
}

/// What the requesting page intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// No particular destination (fetch/XHR).
    #[default]
    Empty,
    /// Full-page navigation.
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: RequestDestination,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: RequestDestination::default(),
            timeout: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .destination(RequestDestination::Document)
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the request destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a plain GET.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// HTTP response.
///
/// Cloning copies headers and shares the body buffer.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response with the given status and body.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create an empty-bodied response.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, Bytes::new())
    }

    /// Create a 200 response carrying `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, NetError> {
        let body = serde_json::to_vec(value).map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self::new(StatusCode::OK, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Decode the body as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed `Content-Type`, if any.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// Anything that can perform a network fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `request`. Transport failures are errors; HTTP error statuses are not.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("IndaiaWorker/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "pt-BR,pt;q=0.9,en;q=0.8".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: false,
        }
    }
}

/// [`Fetcher`] backed by a real HTTP client.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, mode = ?request.mode, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        req_builder = req_builder.header(header::ACCEPT_LANGUAGE, &self.config.accept_language);

        if let Some(body) = &request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/app.js").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/javascript"),
            )
            .destination(RequestDestination::Script)
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert!(request.is_get());
        assert_eq!(request.mode, RequestMode::Cors);
        assert_eq!(request.destination, RequestDestination::Script);
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(Url::parse("https://example.com/").unwrap());
        assert_eq!(request.mode, RequestMode::Navigate);
        assert_eq!(request.destination, RequestDestination::Document);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Request::parse("not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_json_response() {
        let response = Response::json(&serde_json::json!({"ok": true})).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type(), Some(mime::APPLICATION_JSON));
        let value: serde_json::Value = response.json_body().unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_clone_shares_body() {
        let response = Response::new(StatusCode::OK, "tile-bytes");
        let copy = response.clone();
        assert_eq!(copy.body(), response.body());
        assert_eq!(response.text().unwrap(), "tile-bytes");
    }

    #[tokio::test]
    async fn test_http_fetcher_returns_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_fetcher_reads_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/style.css"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("body{}", "text/css"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let request = Request::parse(&format!("{}/style.css", server.uri())).unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.text().unwrap(), "body{}");
        assert_eq!(response.content_type(), Some(mime::TEXT_CSS));
        assert!(response.url.is_some());
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("IndaiaWorker/"));
        assert!(!config.cookies_enabled);
    }
}
