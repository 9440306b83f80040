use tracing::debug;
use url::Url;

use crate::config::RoutesConfig;

/// Fetch strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve from cache, fetch and store on miss
  CacheFirst,
  /// Try the network, fall back to cache on failure
  NetworkFirst,
}

/// Decides the strategy per request URL. First match wins:
/// tile-provider host, then cache-first path extension, else network-first.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
  tile_hosts: Vec<String>,
  extensions: Vec<String>,
}

impl RouteMatcher {
  pub fn new(tile_hosts: Vec<String>, extensions: Vec<String>) -> Self {
    Self {
      tile_hosts,
      extensions,
    }
  }

  pub fn from_config(config: &RoutesConfig) -> Self {
    Self::new(
      config.tile_hosts.clone(),
      config.cache_first_extensions.clone(),
    )
  }

  /// Host contains a tile provider pattern, so subdomains like
  /// `a.tile.openstreetmap.org` match too.
  fn is_tile_host(&self, url: &Url) -> bool {
    url
      .host_str()
      .is_some_and(|host| self.tile_hosts.iter().any(|t| host.contains(t.as_str())))
  }

  /// Extension test on the path only; the query string is ignored.
  fn has_cached_extension(&self, url: &Url) -> bool {
    let path = url.path();
    self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
  }

  pub fn strategy_for(&self, url: &Url) -> Strategy {
    let strategy = if self.is_tile_host(url) || self.has_cached_extension(url) {
      Strategy::CacheFirst
    } else {
      Strategy::NetworkFirst
    };
    debug!(%url, ?strategy, "routed");
    strategy
  }
}

impl Default for RouteMatcher {
  fn default() -> Self {
    Self::from_config(&RoutesConfig::default())
  }
}
