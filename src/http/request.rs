use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use url::Url;

use crate::cache::RequestKey;

/// An intercepted outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  /// Plain GET request, the only kind the manifest produces.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Parse an absolute URL and method name into a request.
  pub fn parse(method: &str, url: &str) -> Result<Self> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method '{}': {}", method, e))?;
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
    Ok(Self::new(method, url))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Only GET requests are looked up in or stored to a cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  /// Identity under which this request is cached.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(self.method.as_str(), &self.url)
  }
}
