//! Bounded in-memory layer in front of the disk store.
//!
//! Entries live for a fixed max-age regardless of their HTTP expiry; the
//! disk remains the source of truth.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::lock::mutex_lock;
use crate::message::OutgoingMessage;

const SOURCE: &str = "cache::hot";

/// Default number of hot entries.
pub const DEFAULT_HOT_CAPACITY: usize = 1000;

/// Default hot entry lifetime (60 seconds).
pub const DEFAULT_HOT_TTL: Duration = Duration::from_secs(60);

struct HotEntry {
    message: OutgoingMessage,
    stored_at: Instant,
}

/// LRU map from digest to verified response, with per-entry max-age.
pub struct HotCache {
    entries: Mutex<LruCache<String, HotEntry>>,
    ttl: Duration,
}

impl HotCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self { entries: Mutex::new(LruCache::new(capacity)), ttl }
    }

    /// Get a live entry; an entry past its max-age is dropped.
    pub fn get(&self, digest: &str) -> Option<OutgoingMessage> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        if let Some(entry) = entries.get(digest)
            && entry.stored_at.elapsed() <= self.ttl
        {
            return Some(entry.message.clone());
        }
        entries.pop(digest);
        None
    }

    pub fn put(&self, digest: &str, message: OutgoingMessage) {
        let entry = HotEntry { message, stored_at: Instant::now() };
        mutex_lock(&self.entries, SOURCE, "put").put(digest.to_string(), entry);
    }

    pub fn remove(&self, digest: &str) {
        mutex_lock(&self.entries, SOURCE, "remove").pop(digest);
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &'static str) -> OutgoingMessage {
        OutgoingMessage::text(200, body)
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let hot = HotCache::new(capacity(4), DEFAULT_HOT_TTL);
        hot.put("a", message("one"));
        assert_eq!(hot.get("a"), Some(message("one")));
        assert_eq!(hot.get("b"), None);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let hot = HotCache::new(capacity(2), DEFAULT_HOT_TTL);
        hot.put("a", message("a"));
        hot.put("b", message("b"));
        hot.get("a");
        hot.put("c", message("c"));

        assert!(hot.get("a").is_some());
        assert!(hot.get("b").is_none());
        assert!(hot.get("c").is_some());
        assert_eq!(hot.len(), 2);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let hot = HotCache::new(capacity(2), Duration::ZERO);
        hot.put("a", message("a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(hot.get("a").is_none());
        assert!(hot.is_empty());
    }

    #[test]
    fn test_remove() {
        let hot = HotCache::new(capacity(2), DEFAULT_HOT_TTL);
        hot.put("a", message("a"));
        hot.remove("a");
        hot.remove("a");
        assert!(hot.get("a").is_none());
    }
}
