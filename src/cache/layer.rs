//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::key::RequestKey;
use super::storage::{CacheHandle, CacheStorage};
use super::traits::CacheResult;
use crate::http::Response;

/// Cache layer bound to the current cache generation.
///
/// This layer sits between the agent and the network fetcher, providing the
/// two fetch strategies over a single generation.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  generation: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer for the given generation.
  pub fn new(storage: Arc<S>, generation: impl Into<String>) -> Self {
    Self {
      storage,
      generation: generation.into(),
    }
  }

  /// Open (creating if absent) the current generation.
  pub fn open(&self) -> Result<CacheHandle<S>> {
    CacheHandle::open(Arc::clone(&self.storage), &self.generation)
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if present, return it without touching the network
  /// 2. If missing, fetch from network (failure propagates)
  /// 3. Store a copy of the response, return the original
  ///
  /// A failed store is logged and does not fail the request.
  pub async fn cache_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let handle = self.open()?;

    if let Some(cached) = handle.lookup(key)? {
      debug!(%key, generation = %self.generation, "cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.stored_at));
    }

    debug!(%key, generation = %self.generation, "cache miss, fetching");
    let response = fetcher().await?;

    if let Err(e) = handle.put(key, &response) {
      warn!(%key, error = %e, "Failed to store response");
    }

    Ok(CacheResult::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network - on success return it, cache untouched
  /// 2. On network failure, return the cached entry (offline mode)
  /// 3. Nothing cached: fail with the network error
  ///
  /// Only transport failures trigger the fallback; HTTP error statuses are
  /// returned as they are.
  pub async fn network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(network_err) => match self.storage.lookup(&self.generation, key)? {
        Some(cached) => {
          debug!(%key, error = %network_err, "network failed, serving cached response");
          Ok(CacheResult::offline(cached.response, cached.stored_at))
        }
        None => Err(network_err.wrap_err(format!("Offline and {} is not cached", key))),
      },
    }
  }
}
