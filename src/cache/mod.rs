//! Version-scoped response cache.
//!
//! This module provides the bucket storage and the two serving strategies:
//! - Cache-first for static assets (no network call once populated)
//! - Network-first for everything else, refreshing the bucket on success
//! - All-or-nothing precaching of the install manifest

mod layer;
mod result;
mod storage;

pub use layer::CacheLayer;
pub use result::{CacheResult, CacheSource, Fallback};
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
