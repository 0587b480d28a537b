//! Path-keyed content cache for file routes.
//!
//! Entries are permanent for the server's lifetime (no eviction); the cache
//! is cleared in bulk at shutdown. Values are shared slices so a cache hit
//! clones a handle into the in-flight write instead of borrowing across the
//! asynchronous gap.

use std::{collections::BTreeMap, sync::Arc};

/// Longest path representable as an inline cache key.
pub const SMALL_CACHE_PATH: usize = 32;

/// Inline cache key: compared by length first, then bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathKey {
    len: u8,
    bytes: [u8; SMALL_CACHE_PATH],
}

impl PathKey {
    /// `None` when the path exceeds [`SMALL_CACHE_PATH`] bytes.
    pub fn new(path: &str) -> Option<Self> {
        let raw = path.as_bytes();
        if raw.len() > SMALL_CACHE_PATH {
            return None;
        }
        let mut bytes = [0u8; SMALL_CACHE_PATH];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            len: raw.len() as u8,
            bytes,
        })
    }
}

/// Path → contents memoization for small-path static resources.
#[derive(Default)]
pub struct FileCache {
    entries: BTreeMap<PathKey, Arc<[u8]>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<[u8]>> {
        let key = PathKey::new(path)?;
        self.entries.get(&key).cloned()
    }

    /// Insert `data` under `path` and return the stored contents.
    ///
    /// The first insertion wins: concurrent identical miss chains each run
    /// to completion, and later arrivals drop their copy in favor of the
    /// stored one. `None` when the path does not fit a key.
    pub fn insert(&mut self, path: &str, data: Arc<[u8]>) -> Option<Arc<[u8]>> {
        let key = PathKey::new(path)?;
        Some(self.entries.entry(key).or_insert(data).clone())
    }

    /// Drop every entry; outstanding writes keep their own handles alive.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    fn contents(text: &str) -> Arc<[u8]> {
        Arc::from(text.as_bytes())
    }

    #[test]
    fn test_get_after_insert() {
        let mut cache = FileCache::new();
        assert!(cache.get("/sample.json").is_none());

        cache.insert("/sample.json", contents("{}")).unwrap();
        assert_eq!(cache.get("/sample.json").unwrap().as_ref(), b"{}");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_first_insert_wins() {
        let mut cache = FileCache::new();
        let stored = cache.insert("/a", contents("first")).unwrap();
        assert_eq!(stored.as_ref(), b"first");

        // A racing duplicate chain writes its own copy and gets the
        // original back.
        let stored = cache.insert("/a", contents("second")).unwrap();
        assert_eq!(stored.as_ref(), b"first");
        assert_eq!(cache.get("/a").unwrap().as_ref(), b"first");
    }

    #[test_case("" ; "empty path")]
    #[test_case("/0123456789012345678901234567890" ; "exactly 32 bytes")]
    fn test_key_fits(path: &str) {
        assert!(PathKey::new(path).is_some());
    }

    #[test]
    fn test_key_too_long() {
        let long = "/".repeat(SMALL_CACHE_PATH + 1);
        assert!(PathKey::new(&long).is_none());

        let mut cache = FileCache::new();
        assert!(cache.insert(&long, contents("x")).is_none());
        assert!(cache.get(&long).is_none());
    }

    #[test]
    fn test_keys_differing_only_in_length() {
        let mut cache = FileCache::new();
        cache.insert("/ab", contents("short")).unwrap();
        cache.insert("/abc", contents("long")).unwrap();
        assert_eq!(cache.get("/ab").unwrap().as_ref(), b"short");
        assert_eq!(cache.get("/abc").unwrap().as_ref(), b"long");
    }

    #[test]
    fn test_clear_keeps_live_handles() {
        let mut cache = FileCache::new();
        let held = cache.insert("/a", contents("payload")).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(held.as_ref(), b"payload");
    }
}
