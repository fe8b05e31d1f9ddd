use futures::StreamExt;
use lru::LruCache;
use reqwest::header::{
    HeaderMap, CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::StatusCode;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of URLs whose responses are kept in the shared cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Errors that can occur while fetching a feed.
///
/// Every variant is treated as transient by the scheduling loop; only a manual
/// [`Feed::update`](crate::feed::Feed::update) surfaces them to a caller.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL scheme has no source implementation.
    #[error("Unsupported scheme '{scheme}' in '{url}'")]
    UnsupportedScheme { scheme: String, url: String },
    /// The feed URL could not be parsed at all.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Simulated failure from a synthetic `example://` source.
    #[error("Synthetic source failure: {0}")]
    Synthetic(&'static str),
}

/// Caching directives read from a `Cache-Control` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CachePolicy {
    pub no_store: bool,
    pub no_cache: bool,
    pub max_age: Option<Duration>,
}

impl CachePolicy {
    fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(parse_cache_control)
            .unwrap_or_default()
    }
}

pub(crate) fn parse_cache_control(value: &str) -> CachePolicy {
    let mut policy = CachePolicy::default();

    for directive in value.split(',') {
        let directive = directive.trim();
        let (name, arg) = match directive.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
            None => (directive, None),
        };

        match name.to_ascii_lowercase().as_str() {
            "no-store" => policy.no_store = true,
            "no-cache" => policy.no_cache = true,
            "max-age" => {
                policy.max_age = arg
                    .and_then(|a| a.parse::<u64>().ok())
                    .map(Duration::from_secs);
            }
            _ => {}
        }
    }

    policy
}

#[derive(Debug, Clone)]
struct CachedResponse {
    body: Arc<Vec<u8>>,
    etag: Option<String>,
    last_modified: Option<String>,
    policy: CachePolicy,
    fresh_until: Option<Instant>,
}

impl CachedResponse {
    fn is_fresh(&self, now: Instant) -> bool {
        self.fresh_until.is_some_and(|until| now < until)
    }

    fn can_revalidate(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

fn fresh_until(policy: &CachePolicy, now: Instant) -> Option<Instant> {
    if policy.no_cache {
        return None;
    }
    policy.max_age.map(|age| now + age)
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// HTTP client shared by every remote feed.
///
/// Cloning is cheap; clones share the connection pool and the response cache.
/// The cache honors `Cache-Control` (`no-store`, `no-cache`, `max-age`) and
/// revalidates stale entries with `If-None-Match` / `If-Modified-Since`.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    cache: Option<Arc<Mutex<LruCache<String, CachedResponse>>>>,
}

impl HttpClient {
    /// Builds a client with the crate's user agent and a response cache of
    /// `cache_capacity` entries (0 disables caching).
    pub fn new(cache_capacity: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feedreader/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, cache_capacity))
    }

    /// Wraps an existing `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, cache_capacity: usize) -> Self {
        let cache =
            NonZeroUsize::new(cache_capacity).map(|cap| Arc::new(Mutex::new(LruCache::new(cap))));
        Self { client, cache }
    }

    fn cached(&self, url: &str) -> Option<CachedResponse> {
        let cache = self.cache.as_ref()?;
        let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(url).cloned()
    }

    fn store(&self, url: &str, entry: CachedResponse) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.put(url.to_string(), entry);
        }
    }

    fn forget(&self, url: &str) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.pop(url);
        }
    }

    /// Fetches the body at `url`, serving or revalidating from the cache when
    /// the previous response allows it.
    pub async fn get(&self, url: &str) -> Result<Arc<Vec<u8>>, FetchError> {
        let cached = self.cached(url);

        if let Some(entry) = &cached {
            if entry.is_fresh(Instant::now()) {
                tracing::debug!(url = %url, "Serving feed from cache");
                return Ok(Arc::clone(&entry.body));
            }
        }

        let mut request = self.client.get(url);
        if let Some(entry) = &cached {
            if let Some(etag) = &entry.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &entry.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if response.status() == StatusCode::NOT_MODIFIED {
            let Some(mut entry) = cached.filter(CachedResponse::can_revalidate) else {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            };
            if response.headers().contains_key(CACHE_CONTROL) {
                entry.policy = CachePolicy::from_headers(response.headers());
            }
            entry.fresh_until = fresh_until(&entry.policy, Instant::now());
            tracing::debug!(url = %url, "Feed not modified, reusing cached body");
            let body = Arc::clone(&entry.body);
            self.store(url, entry);
            return Ok(body);
        }

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let policy = CachePolicy::from_headers(response.headers());
        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);

        let body = Arc::new(read_limited_bytes(response, MAX_FEED_SIZE).await?);

        let entry = CachedResponse {
            body: Arc::clone(&body),
            etag,
            last_modified,
            policy,
            fresh_until: fresh_until(&policy, Instant::now()),
        };
        if policy.no_store || (policy.max_age.is_none() && !entry.can_revalidate()) {
            self.forget(url);
        } else {
            self.store(url, entry);
        }

        Ok(body)
    }
}

fn exceeds_limit(content_length: u64, limit: usize) -> bool {
    usize::try_from(content_length).map_or(true, |len| len > limit)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if exceeds_limit(len, limit) {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
