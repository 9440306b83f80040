//! Cache storage trait with in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::key::RequestKey;
use crate::http::Response;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored snapshot
  pub response: Response,
  /// When the response was stored
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every operation is atomic per key; concurrent fetch handlers share one
/// backend without further coordination.
pub trait CacheStorage: Send + Sync {
  /// Create the named generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<()>;

  /// Names of all generations, oldest first.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and every entry in it. Returns false if it was absent.
  fn delete(&self, generation: &str) -> Result<bool>;

  /// Look up a stored response. A missing generation is a miss.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a copy of `response` in an existing generation.
  ///
  /// Fails if the generation is absent: a deleted generation stays deleted.
  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Identities stored in a generation, in insertion order.
  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>>;
}

/// A generation opened on a storage backend.
pub struct CacheHandle<S: CacheStorage> {
  storage: Arc<S>,
  name: String,
}

impl<S: CacheStorage> CacheHandle<S> {
  /// Open (creating if absent) the named generation.
  pub fn open(storage: Arc<S>, name: &str) -> Result<Self> {
    storage.open(name)?;
    Ok(Self {
      storage,
      name: name.to_string(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.storage.lookup(&self.name, key)
  }

  pub fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
    self.storage.put(&self.name, key, response)
  }
}

// ============================================================================
// In-memory storage
// ============================================================================

struct MemoryGeneration {
  name: String,
  entries: Vec<(RequestKey, CachedResponse)>,
}

/// Storage that lives only as long as the process.
/// Used for `--ephemeral` runs and in tests.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Vec<MemoryGeneration>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<MemoryGeneration>>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let mut generations = self.lock()?;
    if !generations.iter().any(|g| g.name == generation) {
      generations.push(MemoryGeneration {
        name: generation.to_string(),
        entries: Vec::new(),
      });
    }
    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|g| g.name.clone()).collect())
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut generations = self.lock()?;
    let before = generations.len();
    generations.retain(|g| g.name != generation);
    Ok(generations.len() != before)
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find(|g| g.name == generation)
        .and_then(|g| g.entries.iter().find(|(k, _)| k == key))
        .map(|(_, cached)| cached.clone()),
    )
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut generations = self.lock()?;
    let generation = generations
      .iter_mut()
      .find(|g| g.name == generation)
      .ok_or_else(|| eyre!("Cache generation {} does not exist", generation))?;
    let cached = CachedResponse {
      response: response.clone(),
      stored_at: Utc::now(),
    };

    generation.entries.retain(|(k, _)| k != key);
    generation.entries.push((key.clone(), cached));
    Ok(())
  }

  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
    let generations = self.lock()?;
    Ok(
      generations
        .iter()
        .find(|g| g.name == generation)
        .map(|g| g.entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Database that disappears with the process.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation (named by version tag)
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request identity
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, key_hash),
    FOREIGN KEY (generation) REFERENCES cache_generations(name) ON DELETE CASCADE
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to open cache generation {}: {}", generation, e))?;

    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  fn delete(&self, generation: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", generation, e))?;

    let removed = tx
      .execute(
        "DELETE FROM cache_generations WHERE name = ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    debug!(generation, removed, "deleted cache generation");
    Ok(removed > 0)
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT response_url, status, status_text, headers, body, stored_at FROM cache_entries
         WHERE generation = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, String, Vec<u8>, String)> = stmt
      .query_row(params![generation, key.cache_hash()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    match row {
      Some((url, status, status_text, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            url,
            status,
            status_text,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    // The foreign key rejects entries for a generation that does not exist
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (generation, key_hash, method, url, response_url, status, status_text, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          generation,
          key.cache_hash(),
          key.method(),
          key.url(),
          response.url,
          response.status,
          response.status_text,
          headers,
          response.body,
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, generation, e))?;

    Ok(())
  }

  fn keys(&self, generation: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE generation = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![generation], |row| {
        Ok(RequestKey::from_stored(row.get(0)?, row.get(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", generation, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", generation, e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
