//! Memoized request fingerprints.
//!
//! Hashing the identity of every request is cheap but not free; popular URLs
//! hit the same identity over and over. The memo is bounded and losing an
//! entry only costs a recomputation.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::cache::hash::compute_digest;
use crate::lock::mutex_lock;

const SOURCE: &str = "fingerprint";

/// Default number of memoized identities.
pub const DEFAULT_FINGERPRINT_CAPACITY: usize = 1000;

/// Bounded identity → digest memo.
pub struct Fingerprints {
    memo: Mutex<LruCache<String, String>>,
}

impl Fingerprints {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { memo: Mutex::new(LruCache::new(capacity)) }
    }

    /// Digest for `identity`, computed on first use.
    pub fn digest(&self, identity: &str) -> String {
        if let Some(digest) = mutex_lock(&self.memo, SOURCE, "get").get(identity) {
            return digest.clone();
        }
        let digest = compute_digest(identity);
        mutex_lock(&self.memo, SOURCE, "put").put(identity.to_string(), digest.clone());
        digest
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.memo, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Fingerprints {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_FINGERPRINT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}
