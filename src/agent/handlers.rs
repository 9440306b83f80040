use color_eyre::{eyre::eyre, Report, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::router::{RouteMatcher, Strategy};
use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::http::{Fetcher, Request, Response};

/// Outcome of cleaning up superseded cache generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  /// Generations removed
  pub deleted: Vec<String>,
  /// Generations whose deletion failed (left in place)
  pub failed: Vec<String>,
}

/// Offline caching agent for one deployed version.
///
/// Holds no mutable state of its own: every handler can run concurrently with
/// any other, sharing only the storage backend.
pub struct CacheAgent<S: CacheStorage, F: Fetcher> {
  version: String,
  manifest: Vec<Url>,
  router: RouteMatcher,
  storage: Arc<S>,
  cache: CacheLayer<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> CacheAgent<S, F> {
  pub fn new(
    version: impl Into<String>,
    manifest: Vec<Url>,
    router: RouteMatcher,
    storage: Arc<S>,
    fetcher: Arc<F>,
  ) -> Self {
    let version = version.into();
    let cache = CacheLayer::new(Arc::clone(&storage), version.clone());
    Self {
      version,
      manifest,
      router,
      storage,
      cache,
      fetcher,
    }
  }

  /// Version tag, also the name of the current cache generation.
  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  /// Pre-cache every manifest entry into the current generation.
  ///
  /// All entries are fetched concurrently. Any transport failure or non-2xx
  /// status fails the whole install and nothing is stored; the caller may
  /// retry. Returns the number of entries stored.
  pub async fn install(&self) -> Result<usize> {
    info!(version = %self.version, entries = self.manifest.len(), "installing");

    let handle = self.cache.open()?;

    let fetched = try_join_all(self.manifest.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to pre-cache {}", url)))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {}",
          url,
          response.status
        ));
      }

      Ok::<_, Report>((request.key(), response))
    }))
    .await?;

    for (key, response) in &fetched {
      handle.put(key, response)?;
    }

    info!(generation = handle.name(), stored = fetched.len(), "installed");
    Ok(fetched.len())
  }

  /// Delete every cache generation except the current one.
  ///
  /// Deletion is best-effort: a failing generation is logged and reported
  /// without stopping the others.
  pub async fn activate(&self) -> Result<ActivateReport> {
    let whitelist = [self.version.as_str()];
    let mut report = ActivateReport::default();

    for name in self.storage.generations()? {
      if whitelist.contains(&name.as_str()) {
        continue;
      }

      match self.storage.delete(&name) {
        Ok(_) => {
          info!(generation = %name, "deleted stale cache generation");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(generation = %name, error = %e, "Failed to delete cache generation");
          report.failed.push(name);
        }
      }
    }

    info!(
      version = %self.version,
      deleted = report.deleted.len(),
      failed = report.failed.len(),
      "activated"
    );
    Ok(report)
  }

  /// Answer an intercepted request, cache-first for tiles and images,
  /// network-first for everything else.
  ///
  /// Requests other than GET go straight to the network on either route and
  /// never touch the cache.
  pub async fn handle_fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    if !request.is_cacheable() {
      debug!(method = %request.method, url = %request.url, "not cacheable, passing through");
      let response = self.fetcher.fetch(request).await?;
      return Ok(CacheResult::from_network(response));
    }

    let key = request.key();
    let fetch = || self.fetcher.fetch(request);

    match self.router.strategy_for(&request.url) {
      Strategy::CacheFirst => self.cache.cache_first(&key, fetch).await,
      Strategy::NetworkFirst => self.cache.network_first(&key, fetch).await,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::agent::{Manifest, DEFAULT_MANIFEST};
  use crate::cache::{CacheSource, RequestKey, SqliteStorage};
  use crate::testing::{FakeFetcher, RecordingStorage};

  const ORIGIN: &str = "https://example.org/tracker/";
  const TILE: &str = "https://tile.openstreetmap.org/12/2148/1427.png";

  fn manifest_urls() -> Vec<Url> {
    Manifest::default()
      .resolve(&Url::parse(ORIGIN).unwrap())
      .unwrap()
  }

  fn serve_manifest(fetcher: &FakeFetcher) {
    for url in manifest_urls() {
      fetcher.serve(url.as_str(), url.path());
    }
  }

  fn agent(
    version: &str,
  ) -> (
    Arc<RecordingStorage>,
    Arc<FakeFetcher>,
    CacheAgent<RecordingStorage, FakeFetcher>,
  ) {
    let storage = Arc::new(RecordingStorage::new());
    let fetcher = Arc::new(FakeFetcher::new());
    let agent = CacheAgent::new(
      version,
      manifest_urls(),
      RouteMatcher::default(),
      Arc::clone(&storage),
      Arc::clone(&fetcher),
    );
    (storage, fetcher, agent)
  }

  fn sqlite_agent(
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<FakeFetcher>,
    version: &str,
  ) -> CacheAgent<SqliteStorage, FakeFetcher> {
    CacheAgent::new(
      version,
      manifest_urls(),
      RouteMatcher::default(),
      Arc::clone(storage),
      Arc::clone(fetcher),
    )
  }

  fn get(url: &str) -> Request {
    Request::parse("GET", url).unwrap()
  }

  #[tokio::test]
  async fn test_install_caches_every_manifest_entry() {
    let (storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);

    let stored = agent.install().await.unwrap();

    assert_eq!(stored, DEFAULT_MANIFEST.len());
    for url in manifest_urls() {
      let key = RequestKey::new("GET", &url);
      let cached = storage.lookup("v1", &key).unwrap();
      assert!(cached.is_some(), "{} not cached", url);
    }
  }

  #[tokio::test]
  async fn test_install_fails_when_an_entry_fails() {
    let (storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);
    fetcher.fail("https://example.org/tracker/main.css");

    let err = agent.install().await.unwrap_err();

    assert!(format!("{:?}", err).contains("main.css"));
    assert_eq!(storage.puts(), 0);
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let (_storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);
    fetcher.serve_status("https://example.org/tracker/manifest.json", 404, "");

    let err = agent.install().await.unwrap_err();
    assert!(err.to_string().contains("status 404"));
  }

  #[tokio::test]
  async fn test_install_can_be_retried() {
    let (storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);
    fetcher.set_offline(true);
    assert!(agent.install().await.is_err());

    fetcher.set_offline(false);
    agent.install().await.unwrap();
    assert_eq!(storage.keys("v1").unwrap().len(), DEFAULT_MANIFEST.len());
  }

  #[tokio::test]
  async fn test_activate_keeps_only_current_generation() {
    let (storage, _fetcher, agent) = agent("v2");
    storage.open("v0").unwrap();
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    storage.open("someone-elses-cache").unwrap();

    let report = agent.activate().await.unwrap();

    assert_eq!(storage.generations().unwrap(), vec!["v2"]);
    assert_eq!(report.deleted, vec!["v0", "v1", "someone-elses-cache"]);
    assert!(report.failed.is_empty());
  }

  #[tokio::test]
  async fn test_activate_without_current_generation() {
    let (storage, _fetcher, agent) = agent("v2");
    storage.open("v1").unwrap();

    agent.activate().await.unwrap();
    assert!(storage.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_continues_past_failed_deletion() {
    let (storage, _fetcher, agent) = agent("v3");
    storage.open("v1").unwrap();
    storage.open("v2").unwrap();
    storage.refuse_delete("v1");

    let report = agent.activate().await.unwrap();

    assert_eq!(report.deleted, vec!["v2"]);
    assert_eq!(report.failed, vec!["v1"]);
    assert_eq!(storage.generations().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_tile_miss_fetches_once_and_stores_once() {
    let (storage, fetcher, agent) = agent("v1");
    fetcher.serve(TILE, "tile-bytes");

    let result = agent.handle_fetch(&get(TILE)).await.unwrap();

    assert_eq!(fetcher.calls(), vec![TILE]);
    assert_eq!(storage.puts(), 1);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, Response::new(TILE, 200, "tile-bytes"));

    let stored = storage.lookup("v1", &get(TILE).key()).unwrap().unwrap();
    assert_eq!(stored.response, result.data);
  }

  #[tokio::test]
  async fn test_tile_hit_skips_network() {
    let (storage, fetcher, agent) = agent("v1");
    storage.open("v1").unwrap();
    storage
      .put("v1", &get(TILE).key(), &Response::new(TILE, 200, "cached"))
      .unwrap();
    fetcher.serve(TILE, "live");

    let result = agent.handle_fetch(&get(TILE)).await.unwrap();

    assert_eq!(fetcher.call_count(), 0);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached".to_vec());
  }

  #[tokio::test]
  async fn test_second_tile_request_is_served_from_cache() {
    let (_storage, fetcher, agent) = agent("v1");
    fetcher.serve(TILE, "tile-bytes");

    agent.handle_fetch(&get(TILE)).await.unwrap();
    fetcher.set_offline(true);
    let result = agent.handle_fetch(&get(TILE)).await.unwrap();

    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"tile-bytes".to_vec());
  }

  #[tokio::test]
  async fn test_uncached_tile_offline_fails() {
    let (storage, fetcher, agent) = agent("v1");
    fetcher.set_offline(true);

    assert!(agent.handle_fetch(&get(TILE)).await.is_err());
    assert_eq!(storage.puts(), 0);
  }

  #[tokio::test]
  async fn test_png_on_app_origin_is_cache_first() {
    let (storage, fetcher, agent) = agent("v1");
    let icon = "https://example.org/tracker/icons/icon-192x192.png";
    fetcher.serve(icon, "icon");

    agent.handle_fetch(&get(icon)).await.unwrap();
    assert_eq!(storage.puts(), 1);
  }

  #[tokio::test]
  async fn test_post_to_png_path_always_reaches_network() {
    let (storage, fetcher, agent) = agent("v1");
    let upload = "https://example.org/tracker/upload/avatar.png";
    let post = Request::parse("POST", upload).unwrap();

    fetcher.serve(upload, "first");
    let first = agent.handle_fetch(&post).await.unwrap();
    fetcher.serve(upload, "second");
    let second = agent.handle_fetch(&post).await.unwrap();

    assert_eq!(first.data.body, b"first".to_vec());
    assert_eq!(second.source, CacheSource::Network);
    assert_eq!(second.data.body, b"second".to_vec());
    assert_eq!(fetcher.calls(), vec![upload, upload]);
    assert_eq!(storage.lookups(), 0);
    assert_eq!(storage.puts(), 0);
  }

  #[tokio::test]
  async fn test_offline_post_is_not_answered_from_cache() {
    let (_storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);
    agent.install().await.unwrap();
    fetcher.set_offline(true);

    // index.html is cached for GET, but a POST must not see it
    let post = Request::parse("POST", "https://example.org/tracker/index.html").unwrap();
    assert!(agent.handle_fetch(&post).await.is_err());

    let tile = Request::parse("PUT", TILE).unwrap();
    assert!(agent.handle_fetch(&tile).await.is_err());
  }

  #[tokio::test]
  async fn test_network_first_success_touches_no_cache() {
    let (storage, fetcher, agent) = agent("v1");
    let script = "https://example.org/tracker/main.js";
    fetcher.serve(script, "live-js");

    let result = agent.handle_fetch(&get(script)).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"live-js".to_vec());
    assert_eq!(storage.lookups(), 0);
    assert_eq!(storage.puts(), 0);
  }

  #[tokio::test]
  async fn test_offline_app_shell_served_from_install() {
    let (_storage, fetcher, agent) = agent("v1");
    serve_manifest(&fetcher);
    agent.install().await.unwrap();
    fetcher.set_offline(true);

    let result = agent
      .handle_fetch(&get("https://example.org/tracker/index.html"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"/tracker/index.html".to_vec());
  }

  #[tokio::test]
  async fn test_offline_uncached_request_fails() {
    let (_storage, fetcher, agent) = agent("v1");
    fetcher.set_offline(true);

    let result = agent
      .handle_fetch(&get("https://example.org/tracker/api/speed"))
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_upgrade_on_sqlite_storage() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve_manifest(&fetcher);
    fetcher.serve(TILE, "tile-bytes");

    let v1 = sqlite_agent(&storage, &fetcher, "v1");
    assert_eq!(v1.install().await.unwrap(), DEFAULT_MANIFEST.len());
    v1.activate().await.unwrap();
    v1.handle_fetch(&get(TILE)).await.unwrap();
    assert_eq!(storage.keys("v1").unwrap().len(), DEFAULT_MANIFEST.len() + 1);

    let v2 = sqlite_agent(&storage, &fetcher, "v2");
    v2.install().await.unwrap();
    let report = v2.activate().await.unwrap();

    assert_eq!(report.deleted, vec!["v1"]);
    assert!(report.failed.is_empty());
    assert_eq!(storage.generations().unwrap(), vec!["v2"]);
    // Entries go with their generation
    assert!(storage.keys("v1").unwrap().is_empty());
    assert!(storage.lookup("v1", &get(TILE).key()).unwrap().is_none());
    assert_eq!(storage.keys("v2").unwrap().len(), DEFAULT_MANIFEST.len());
  }

  #[tokio::test]
  async fn test_cache_first_on_sqlite_storage() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve_manifest(&fetcher);
    fetcher.serve(TILE, "tile-bytes");
    let agent = sqlite_agent(&storage, &fetcher, "v1");
    agent.install().await.unwrap();

    let miss = agent.handle_fetch(&get(TILE)).await.unwrap();
    fetcher.set_offline(true);
    let hit = agent.handle_fetch(&get(TILE)).await.unwrap();
    let shell = agent
      .handle_fetch(&get("https://example.org/tracker/index.html"))
      .await
      .unwrap();

    assert_eq!(miss.source, CacheSource::Network);
    assert_eq!(hit.source, CacheSource::Cache);
    assert_eq!(hit.data, miss.data);
    assert_eq!(shell.source, CacheSource::Offline);
    assert_eq!(shell.data.body, b"/tracker/index.html".to_vec());
    assert_eq!(
      fetcher.calls().iter().filter(|url| url.as_str() == TILE).count(),
      1
    );
  }
}
