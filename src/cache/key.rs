use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Identity of a request inside a cache generation.
///
/// Two requests address the same entry when their methods match and their
/// URLs match once the fragment is dropped. Headers play no part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url: url.into(),
    }
  }

  /// Rebuild a key from values already normalized by [`RequestKey::new`].
  pub(crate) fn from_stored(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 of the identity, used as a fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}
