use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::agent::DEFAULT_MANIFEST;

/// Cache generation name of the currently deployed app version.
pub const DEFAULT_VERSION: &str = "gps-speed-tracker-cache-v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL the manifest paths are resolved against (e.g. "https://example.org/tracker/")
  pub origin: Option<String>,
  /// Version tag, used as cache generation name
  pub version: String,
  /// Relative asset paths pre-cached at install
  pub manifest: Vec<String>,
  pub routes: RoutesConfig,
  pub http: HttpConfig,
  /// Cache database path (defaults to $XDG_DATA_HOME/tilecache/cache.db)
  pub database: Option<PathBuf>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      version: DEFAULT_VERSION.to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
      routes: RoutesConfig::default(),
      http: HttpConfig::default(),
      database: None,
      log: LogConfig::default(),
    }
  }
}

/// Which requests go through the cache-first strategy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Map tile providers; matched as a substring of the request host
  pub tile_hosts: Vec<String>,
  /// Path suffixes served cache-first (case-sensitive)
  pub cache_first_extensions: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      tile_hosts: vec!["tile.openstreetmap.org".to_string()],
      cache_first_extensions: vec![".png".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub user_agent: String,
  /// Request timeout in seconds; unset means no timeout
  pub timeout_secs: Option<u64>,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      user_agent: concat!("tilecache/", env!("CARGO_PKG_VERSION")).to_string(),
      timeout_secs: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is not set (e.g. "info", "tilecache=debug")
  pub level: Option<String>,
  /// Directory for a daily rolling log file
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tilecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tilecache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tilecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tilecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// The origin as a URL usable as a join base.
  ///
  /// A missing trailing slash is added so that "./index.html" resolves inside
  /// the app directory rather than next to it.
  pub fn origin_url(&self) -> Result<Url> {
    let origin = self
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("No origin configured. Set `origin` in the config or pass --origin"))?;

    let mut url = Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("Origin '{}' cannot be used as a base URL", origin));
    }
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }

    Ok(url)
  }

  /// Path of the cache database.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tilecache").join("cache.db"))
  }
}
