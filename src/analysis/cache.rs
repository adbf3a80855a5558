//! Result cache for completed analyses.
//!
//! The pipeline is deterministic for identical input bytes, so the encoded
//! display image, overlay and counts of an upload can be served again without
//! a forward pass.
//!
//! # Cache Key
//!
//! Entries are keyed by the SHA-256 digest of the uploaded bytes. Settings
//! that influence the result (image size, JPEG quality, counting parameters)
//! are fixed for the lifetime of a cache, so they are not part of the key.
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total size of the cached JPEG data and evicts
//! least-recently-used entries when the capacity is exceeded.

use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::service::AnalysisOutput;

/// Default cache capacity: 64MB
pub const DEFAULT_RESULT_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 1_000;

// =============================================================================
// Cache Key
// =============================================================================

/// SHA-256 digest of an uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadDigest([u8; 32]);

impl UploadDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for UploadDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// =============================================================================
// Result Cache
// =============================================================================

/// LRU cache of analysis outputs with size-based capacity.
///
/// The cache is thread-safe and can be shared across async tasks via `Arc`.
pub struct ResultCache {
    cache: RwLock<LruCache<UploadDigest, AnalysisOutput>>,

    /// Maximum total size in bytes
    max_size: usize,

    /// Current total size in bytes
    current_size: RwLock<usize>,
}

impl ResultCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RESULT_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `max_size` bytes of encoded images.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: RwLock::new(LruCache::new(entries)),
            max_size,
            current_size: RwLock::new(0),
        }
    }

    /// Look up a result. Marks the entry as recently used.
    pub async fn get(&self, key: &UploadDigest) -> Option<AnalysisOutput> {
        let mut cache = self.cache.write().await;
        cache.get(key).cloned()
    }

    /// Check for a result without updating LRU order.
    pub async fn contains(&self, key: &UploadDigest) -> bool {
        let cache = self.cache.read().await;
        cache.contains(key)
    }

    /// Store a result, evicting least-recently-used entries while over
    /// capacity. A single entry larger than the capacity is not kept.
    pub async fn put(&self, key: UploadDigest, output: AnalysisOutput) {
        let data_size = output.encoded_size();
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;

        if let Some(old) = cache.peek(&key) {
            *current_size = current_size.saturating_sub(old.encoded_size());
        }

        // `push` hands back either the replaced value (already subtracted
        // above) or an entry evicted by the entry limit.
        if let Some((evicted_key, evicted)) = cache.push(key, output) {
            if evicted_key != key {
                *current_size = current_size.saturating_sub(evicted.encoded_size());
            }
        }
        *current_size += data_size;

        while *current_size > self.max_size {
            if let Some((_, evicted)) = cache.pop_lru() {
                *current_size = current_size.saturating_sub(evicted.encoded_size());
            } else {
                break;
            }
        }
    }

    /// Clear all entries.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let mut current_size = self.current_size.write().await;
        cache.clear();
        *current_size = 0;
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Current total size of cached images in bytes.
    pub async fn size(&self) -> usize {
        *self.current_size.read().await
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
