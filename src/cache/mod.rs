//! # Cache Module
//!
//! Metadata cache shared by every chat.
//!
//! Resolving a link requires a round-trip to the search backend; the result
//! for a given video id never changes, so it is memoised here. Downloaded
//! media lives on disk in the [`LocalStore`](crate::sources::store::LocalStore)
//! instead and is not cached in memory.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_SIZE=100              # Maximum number of metadata entries
//! CACHE_TTL=3600              # Time-to-live in seconds (1 hour)
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use tracing::info;

use crate::sources::TrackMetadata;

/// Resolved track metadata keyed by video id.
pub type MusicCache = LRUCache<String, TrackMetadata>;

impl MusicCache {
    /// Removes expired entries; meant to be called from a periodic task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
