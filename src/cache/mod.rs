//! Versioned response cache used for offline fallback.
//!
//! This module provides the storage side of the network-first policy:
//! - Responses are grouped into named cache regions, one per deployed version
//! - Entries are keyed by a request descriptor (method, URL, vary headers)
//! - Writes are whole-entry upserts, so repeated fetches overwrite in place
//! - Stale regions are dropped wholesale when a new version activates

mod key;
mod storage;
mod traits;

pub use key::RequestDescriptor;
pub use storage::{CacheStorage, CachedResponse, RegionStats, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Request, Response};
