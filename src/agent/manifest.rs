use color_eyre::{eyre::eyre, Result};
use url::Url;

/// Assets of the tracker app pre-cached at install.
pub const DEFAULT_MANIFEST: &[&str] = &[
  "./",
  "./index.html",
  "./manifest.json",
  "./icons/icon-192x192.png",
  "./icons/icon-512x512.png",
  "./icons/icon-512x512.maskable.png",
  "./main.css",
  "./main.js",
];

/// Ordered list of relative asset paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
  paths: Vec<String>,
}

impl Manifest {
  pub fn new<I, P>(paths: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    Self {
      paths: paths.into_iter().map(Into::into).collect(),
    }
  }

  /// Resolve every path against `origin`, keeping manifest order.
  pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
    self
      .paths
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid manifest entry '{}': {}", path, e))
      })
      .collect()
  }
}

impl Default for Manifest {
  fn default() -> Self {
    Self::new(DEFAULT_MANIFEST.iter().copied())
  }
}
