//! Client-side session status cache
//!
//! Serves status queries from locally cached data while it is fresh and asks
//! the remote core only for the fields that have gone stale. Freshness is
//! tracked per field, so one session can have fresh and stale fields at the
//! same time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod cache;
pub mod entry;
pub mod errors;
mod events;
pub mod status;

pub use cache::{EntityFuture, StatusCache, StatusFuture};
pub use entry::{Refresh, StatusEntry};
pub use errors::ProxyError;
pub use status::{Status, StatusDict, StatusFilter, StatusMap};

/// Default time a cached field stays valid
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_millis(1500);

/// Default number of session ids per batched status request
pub const DEFAULT_CHUNK_SIZE: usize = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    // how long a field value is served from cache before it is refetched
    #[serde(default = "default_cache_time_ms")]
    pub cache_time_ms: u64,

    // max session ids in one batched status request
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    // ask the core for changed fields only
    #[serde(default = "default_diff_only")]
    pub diff_only: bool,
}

fn default_cache_time_ms() -> u64 {
    DEFAULT_CACHE_TIME.as_millis() as u64
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_diff_only() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_time_ms: default_cache_time_ms(),
            chunk_size: default_chunk_size(),
            diff_only: default_diff_only(),
        }
    }
}

impl CacheConfig {
    pub fn cache_time(&self) -> Duration {
        Duration::from_millis(self.cache_time_ms)
    }

    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
