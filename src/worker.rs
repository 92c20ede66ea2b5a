//! The offline cache: pre-caches a fixed resource list on install and answers
//! requests cache-first with a network fallback.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{Cache, CacheResult, CacheStorage, CachedResponse, Request};
use crate::net::{resolve, Transport};

/// Name of the cache the resource list is stored under.
pub const CACHE_NAME: &str = "defect-system-v1";

/// Resources stored on install, relative to the origin.
pub const PRECACHE_URLS: &[&str] = &["/", "/index.html", "/manifest.json"];

/// Cache-first request handler with install-time pre-caching.
///
/// The named cache is written only by [`OfflineCache::install`]; request
/// handling never stores anything.
pub struct OfflineCache<S: CacheStorage, T: Transport> {
  storage: Arc<S>,
  transport: Arc<T>,
  cache_name: String,
  resources: Vec<Url>,
}

impl<S: CacheStorage, T: Transport> OfflineCache<S, T> {
  /// Create an offline cache for the built-in cache name and resource list.
  pub fn new(storage: S, transport: T, origin: &Url) -> Result<Self> {
    Self::with_manifest(storage, transport, origin, CACHE_NAME, PRECACHE_URLS)
  }

  /// Create an offline cache for an explicit cache name and resource list.
  pub fn with_manifest(
    storage: S,
    transport: T,
    origin: &Url,
    cache_name: &str,
    resources: &[&str],
  ) -> Result<Self> {
    let resources = resources
      .iter()
      .map(|r| resolve(origin, r))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      storage: Arc::new(storage),
      transport: Arc::new(transport),
      cache_name: cache_name.to_string(),
      resources,
    })
  }

  pub fn cache_name(&self) -> &str {
    &self.cache_name
  }

  pub fn resources(&self) -> &[Url] {
    &self.resources
  }

  /// Fetch every resource and store the responses in the named cache.
  ///
  /// All fetches must succeed with a 2xx status before anything is written;
  /// otherwise the cache is left untouched (and not created if it did not
  /// exist). Returns the number of entries stored.
  pub async fn install(&self) -> Result<usize> {
    info!(
      cache = %self.cache_name,
      count = self.resources.len(),
      "Caching files for offline use"
    );

    let requests: Vec<Request> = self.resources.iter().cloned().map(Request::get).collect();

    let mut seen = HashSet::new();
    for request in &requests {
      if !seen.insert(request.cache_key()) {
        return Err(eyre!("Duplicate resource in pre-cache list: {}", request.url));
      }
    }

    let fetches: Vec<_> = requests.iter().map(|r| self.fetch_for_install(r)).collect();
    let responses = try_join_all(fetches).await?;

    let cache = self.storage.open(&self.cache_name)?;
    let entries: Vec<(Request, CachedResponse)> = requests.into_iter().zip(responses).collect();
    cache.put_all(&entries)?;

    info!(cache = %cache.name(), count = entries.len(), "Pre-cache complete");
    Ok(entries.len())
  }

  async fn fetch_for_install(&self, request: &Request) -> Result<CachedResponse> {
    let response = self.transport.fetch(request).await?;
    if !response.is_ok() {
      return Err(eyre!(
        "Failed to cache {}: server responded with status {}",
        request.url,
        response.status
      ));
    }
    Ok(response)
  }

  /// Answer a request from any cache, or from the network on a miss.
  ///
  /// Network responses are returned as-is, whatever their status, and are
  /// never written back. Transport failures propagate unchanged.
  pub async fn handle_fetch(&self, request: &Request) -> Result<CacheResult<CachedResponse>> {
    if let Some(cached) = self.storage.match_request(request)? {
      debug!(url = %request.url, "cache hit");
      return Ok(CacheResult::from_cache(cached));
    }

    debug!(url = %request.url, method = %request.method, "cache miss, fetching");
    let response = self.transport.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Keys stored in the named cache, or nothing if it was never installed.
  pub fn keys(&self) -> Result<Vec<String>> {
    if !self.storage.has(&self.cache_name)? {
      return Ok(Vec::new());
    }
    self.storage.open(&self.cache_name)?.keys()
  }

  /// Every stored response in the named cache, in insertion order.
  pub fn entries(&self) -> Result<Vec<(String, CachedResponse)>> {
    let keys = self.keys()?;
    if keys.is_empty() {
      return Ok(Vec::new());
    }

    let cache = self.storage.open(&self.cache_name)?;
    let mut entries = Vec::new();
    for key in keys {
      let url = Url::parse(&key).map_err(|e| eyre!("Invalid stored key {}: {}", key, e))?;
      if let Some(response) = cache.match_request(&Request::get(url))? {
        entries.push((key, response));
      }
    }
    Ok(entries)
  }

  /// Names of every cache in storage, in creation order.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    self.storage.names()
  }
}

impl<S: CacheStorage, T: Transport> Clone for OfflineCache<S, T> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      transport: Arc::clone(&self.transport),
      cache_name: self.cache_name.clone(),
      resources: self.resources.clone(),
    }
  }
}
