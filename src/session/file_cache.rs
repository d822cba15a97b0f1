//! File version cache: last known content per canonical path.
//!
//! Patch and edit operations require the target to be present here, which is
//! how "read before you modify" is enforced. Read diffs are computed against
//! the cached content.
//!
//! # Eviction
//!
//! The cache is bounded (200 entries by default). When full, the entry that
//! was touched least recently is evicted. Every successful read, write and
//! patch touches the entry for its path.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default number of tracked files.
pub const DEFAULT_FILE_CACHE_CAPACITY: usize = 200;

/// SHA-256 hash of some content, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash a string.
    pub fn from_content(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Hash raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    content: String,
    /// Logical clock value of the last touch; smallest is evicted first.
    last_touched: u64,
}

/// Cache statistics for debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries_added: u64,
    pub entries_evicted: u64,
}

/// Bounded LRU map from canonical path to last-read content.
#[derive(Debug, Clone)]
pub struct FileVersionCache {
    entries: HashMap<PathBuf, CacheEntry>,
    capacity: usize,
    clock: u64,
    stats: CacheStats,
}

impl Default for FileVersionCache {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_CACHE_CAPACITY)
    }
}

impl FileVersionCache {
    /// Create a cache holding at most `capacity` files (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Store `content` for `path`, refreshing its position.
    pub fn track(&mut self, path: &Path, content: impl Into<String>) {
        self.clock += 1;
        let content = content.into();
        if let Some(entry) = self.entries.get_mut(path) {
            entry.content = content;
            entry.last_touched = self.clock;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                content,
                last_touched: self.clock,
            },
        );
        self.stats.entries_added += 1;
    }

    /// Cached content for `path`, refreshing its position.
    pub fn get(&mut self, path: &Path) -> Option<&str> {
        self.clock += 1;
        match self.entries.get_mut(path) {
            Some(entry) => {
                entry.last_touched = self.clock;
                self.stats.hits += 1;
                Some(entry.content.as_str())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Cached content without affecting recency.
    pub fn peek(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).map(|e| e.content.as_str())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<String> {
        self.entries.remove(path).map(|e| e.content)
    }

    /// Move the entry for `from` to `to`, if present.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        if let Some(content) = self.remove(from) {
            self.track(to, content);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.clock = 0;
        self.stats = CacheStats::default();
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_touched)
            .map(|(path, _)| path.clone());

        if let Some(path) = oldest {
            self.entries.remove(&path);
            self.stats.entries_evicted += 1;
            tracing::trace!(path = %path.display(), "evicted file version");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash() {
        let a = ContentHash::from_content("hello");
        let b = ContentHash::from_content("hello");
        let c = ContentHash::from_content("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_track_and_get() {
        let mut cache = FileVersionCache::default();
        let path = Path::new("/tmp/a.txt");
        assert!(cache.get(path).is_none());

        cache.track(path, "one");
        assert_eq!(cache.get(path), Some("one"));
        cache.track(path, "two");
        assert_eq!(cache.get(path), Some("two"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = FileVersionCache::new(2);
        let a = Path::new("/a");
        let b = Path::new("/b");
        let c = Path::new("/c");

        cache.track(a, "a");
        cache.track(b, "b");
        // Touch a so b becomes the oldest
        cache.get(a);
        cache.track(c, "c");

        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
        assert_eq!(cache.stats().entries_evicted, 1);
    }

    #[test]
    fn test_default_capacity_bound() {
        let mut cache = FileVersionCache::default();
        for i in 0..250 {
            cache.track(&PathBuf::from(format!("/f{i}")), "x");
        }
        assert_eq!(cache.len(), DEFAULT_FILE_CACHE_CAPACITY);
        assert!(!cache.contains(Path::new("/f0")));
        assert!(cache.contains(Path::new("/f249")));
    }

    #[test]
    fn test_rename() {
        let mut cache = FileVersionCache::default();
        cache.track(Path::new("/old"), "content");
        cache.rename(Path::new("/old"), Path::new("/new"));
        assert!(!cache.contains(Path::new("/old")));
        assert_eq!(cache.peek(Path::new("/new")), Some("content"));
    }
}
