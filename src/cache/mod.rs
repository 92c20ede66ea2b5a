//! Named, persistent response caches.
//!
//! This module provides the storage side of the offline cache:
//! - Named caches mapping a request key (URL without fragment) to a response
//! - Atomic population of a cache from a batch of responses
//! - Lookup in a single cache or across every cache in creation order

mod storage;
mod traits;

pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{Cache, CacheResult, CacheSource, CacheStorage, CachedResponse, Request};
