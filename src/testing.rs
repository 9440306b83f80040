//! Fake collaborators for exercising the agent without a network or disk.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::cache::{CacheStorage, CachedResponse, MemoryStorage, RequestKey};
use crate::http::{Fetcher, Request, Response};

/// Fetcher answering from a fixed table. Unknown URLs get a 404.
///
/// Requests to a held URL wait until `release` is called, which lets a test
/// interleave other work with a fetch that is in flight.
pub struct FakeFetcher {
  responses: Mutex<HashMap<String, Response>>,
  failing: Mutex<HashSet<String>>,
  held: Mutex<HashSet<String>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
  started: Notify,
  gate: Semaphore,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
      failing: Mutex::new(HashSet::new()),
      held: Mutex::new(HashSet::new()),
      offline: AtomicBool::new(false),
      calls: Mutex::new(Vec::new()),
      started: Notify::new(),
      gate: Semaphore::new(0),
    }
  }

  pub fn serve(&self, url: &str, body: &str) {
    self.serve_status(url, 200, body);
  }

  pub fn serve_status(&self, url: &str, status: u16, body: &str) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), Response::new(url, status, body));
  }

  /// Make requests to `url` fail at the transport level.
  pub fn fail(&self, url: &str) {
    self.failing.lock().unwrap().insert(url.to_string());
  }

  /// Make requests to `url` block until released.
  pub fn hold(&self, url: &str) {
    self.held.lock().unwrap().insert(url.to_string());
  }

  /// Wait until a request to a held URL is in flight.
  pub async fn wait_until_held(&self) {
    self.started.notified().await;
  }

  /// Let one held request continue.
  pub fn release(&self) {
    self.gate.add_permits(1);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    let held = self.held.lock().unwrap().contains(&url);
    if held {
      self.started.notify_one();
      self
        .gate
        .acquire()
        .await
        .map_err(|e| eyre!("gate closed: {}", e))?
        .forget();
    }

    if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&url) {
      return Err(eyre!("network unreachable: {}", url));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Response::new(url, 404, "")),
    )
  }
}

/// In-memory storage that counts reads and writes and can refuse deletions
/// or listing.
#[derive(Default)]
pub struct RecordingStorage {
  inner: MemoryStorage,
  lookups: AtomicUsize,
  puts: AtomicUsize,
  undeletable: Mutex<HashSet<String>>,
  unlistable: AtomicBool,
}

impl RecordingStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lookups(&self) -> usize {
    self.lookups.load(Ordering::SeqCst)
  }

  pub fn puts(&self) -> usize {
    self.puts.load(Ordering::SeqCst)
  }

  pub fn refuse_delete(&self, generation: &str) {
    self.undeletable.lock().unwrap().insert(generation.to_string());
  }

  /// Make `generations` fail while set.
  pub fn refuse_listing(&self, refuse: bool) {
    self.unlistable.store(refuse, Ordering::SeqCst);
  }
}

impl CacheStorage for RecordingStorage {
  fn open(&self, generation: &str) -> Result<()> {
    self.inner.open(generation)
  }

  fn generations(&self) -> Result<Vec<String>> {
    if self.unlistable.load(Ordering::SeqCst) {
      return Err(eyre!("cache index unavailable"));
    }
    self.inner.generations()
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    if self.undeletable.lock().unwrap().contains(generation) {
      return Err(eyre!("generation {} is locked", generation));
    }
    self.inner.delete(generation)
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.lookups.fetch_add(1, Ordering::SeqCst);
    self.inner.lookup(generation, key)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self.puts.fetch_add(1, Ordering::SeqCst);
    self.inner.put(generation, key, response)
  }

  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
    self.inner.keys(generation)
  }
}
