//! Generational response cache for offline support.
//!
//! This module provides the storage side of the cache agent:
//! - Named cache generations, one per deployed version
//! - Responses stored under a request identity (method + URL without fragment)
//! - Cache-first and network-first fetch strategies on top of a generation

mod key;
mod layer;
mod storage;
mod traits;

pub use key::RequestKey;
pub use layer::CacheLayer;
pub use storage::{CacheHandle, CacheStorage, CachedResponse, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
