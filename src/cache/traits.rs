//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use url::Url;

/// An outgoing resource request routed through the offline cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub url: Url,
  /// Upper-case HTTP method
  pub method: String,
  pub headers: Vec<(String, String)>,
}

impl Request {
  /// A plain GET request with no extra headers.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: "GET".to_string(),
      headers: Vec::new(),
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Key under which this request is stored: the URL without its fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Only GET requests can be answered from a cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }
}

/// A response as stored in (or served from) a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  /// Final URL the response was fetched from
  pub url: String,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the response was received
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value matching `name` (case-insensitive).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Result of a request-interception, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  /// Create a new result from a live network response.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
    }
  }

  /// Create a new result from a stored response.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Stored response, no network access
  Cache,
  /// Live network response, not stored
  Network,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Cache => f.write_str("cache"),
      CacheSource::Network => f.write_str("network"),
    }
  }
}

/// Handle to one named cache.
pub trait Cache: Send + Sync {
  /// Name the cache was opened under.
  fn name(&self) -> &str;

  /// Store every response under its request's key, all or nothing.
  fn put_all(&self, entries: &[(Request, CachedResponse)]) -> Result<()>;

  /// Look up a request by exact key.
  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Keys of every stored entry, in insertion order.
  fn keys(&self) -> Result<Vec<String>>;
}

/// Trait for cache storage backends: a set of named caches.
pub trait CacheStorage: Send + Sync {
  type Handle: Cache;

  /// Open the named cache, creating it if absent.
  fn open(&self, name: &str) -> Result<Self::Handle>;

  /// Whether a cache with this name exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Names of every cache, in creation order.
  fn names(&self) -> Result<Vec<String>>;

  /// Look up a request across every cache in creation order.
  fn match_request(&self, request: &Request) -> Result<Option<CachedResponse>>;
}
