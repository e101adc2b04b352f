//! Persistent entry storage: fetch, write and purge by digest.
//!
//! Each entry is two sibling files, the raw body and a JSON metadata record
//! `{hash, more: {status, headers}}`, placed in a two-level shard derived from
//! the first four hex characters of the digest.

use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use super::hash::{compute_checksum, validate_digest};
use super::hot::{DEFAULT_HOT_CAPACITY, DEFAULT_HOT_TTL, HotCache};
use crate::Error;
use crate::message::{Headers, MAX_BODY_BYTES, OutgoingMessage};

const META_SUFFIX: &str = ".meta";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory shared by every process fronting the same origin.
    pub root_dir: PathBuf,
    /// Largest body accepted when loading an entry.
    pub max_body_bytes: usize,
    /// Hot layer capacity (entries).
    pub hot_capacity: NonZeroUsize,
    /// Hot layer per-entry max-age.
    pub hot_ttl: Duration,
}

impl StoreConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_body_bytes: MAX_BODY_BYTES,
            hot_capacity: NonZeroUsize::new(DEFAULT_HOT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            hot_ttl: DEFAULT_HOT_TTL,
        }
    }
}

/// On-disk metadata record.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    hash: String,
    more: EntryMore,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMore {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: Headers,
}

fn default_status() -> u16 {
    200
}

/// Locations of the artifacts for one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    pub dir: PathBuf,
    pub body: PathBuf,
    pub meta: PathBuf,
}

impl EntryPaths {
    /// Resolve the shard directory and file paths for `digest`.
    pub fn resolve(root: &Path, digest: &str) -> Result<Self, Error> {
        validate_digest(digest)?;
        let dir = root.join(&digest[0..2]).join(&digest[2..4]);
        let body = dir.join(digest);
        let meta = dir.join(format!("{digest}{META_SUFFIX}"));
        Ok(Self { dir, body, meta })
    }
}

/// Disk store fronted by a [`HotCache`].
pub struct CacheStore {
    root: PathBuf,
    max_body_bytes: usize,
    hot: HotCache,
}

impl CacheStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            root: config.root_dir,
            max_body_bytes: config.max_body_bytes,
            hot: HotCache::new(config.hot_capacity, config.hot_ttl),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, digest: &str) -> Result<EntryPaths, Error> {
        EntryPaths::resolve(&self.root, digest)
    }

    /// Load the entry stored under `digest`.
    ///
    /// # Errors
    ///
    /// - `Error::IllegalInput` for a malformed digest
    /// - `Error::StoreIo` if either artifact is missing or unreadable
    /// - `Error::Integrity` if the body does not match its checksum; the
    ///   files are left in place
    pub async fn fetch(&self, digest: &str) -> Result<OutgoingMessage, Error> {
        let paths = self.paths(digest)?;
        if let Some(message) = self.hot.get(digest) {
            return Ok(message);
        }

        let (meta, body) = tokio::try_join!(fs::read(&paths.meta), fs::read(&paths.body))
            .map_err(Error::store_io(digest))?;
        let meta: EntryMeta = serde_json::from_slice(&meta)
            .map_err(|e| Error::store_io(digest)(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if meta.hash != compute_checksum(&body) {
            tracing::warn!(digest, path = %paths.body.display(), "cached body failed checksum verification");
            return Err(Error::Integrity(digest.to_string()));
        }

        let message = OutgoingMessage::new(meta.more.status, meta.more.headers, body, self.max_body_bytes)?;
        self.hot.put(digest, message.clone());
        Ok(message)
    }

    /// Persist `entry` under `digest`, replacing any previous entry.
    ///
    /// Both files are written to a temporary name and renamed into place.
    pub async fn write(&self, digest: &str, entry: &OutgoingMessage) -> Result<(), Error> {
        let paths = self.paths(digest)?;
        fs::create_dir_all(&paths.dir).await.map_err(Error::store_io(digest))?;

        let meta = EntryMeta {
            hash: compute_checksum(entry.body()),
            more: EntryMore { status: entry.status(), headers: entry.headers().clone() },
        };
        let meta = serde_json::to_vec(&meta).map_err(|e| Error::Serialization(e.to_string()))?;

        tokio::try_join!(write_replace(&paths.meta, &meta), write_replace(&paths.body, entry.body()))
            .map_err(Error::store_io(digest))?;
        self.hot.remove(digest);

        tracing::debug!(digest, bytes = entry.body().len(), "cache entry written");
        Ok(())
    }

    /// Remove the entry under `digest` from both layers.
    ///
    /// Purging an absent entry succeeds.
    pub async fn purge(&self, digest: &str) -> Result<(), Error> {
        let paths = self.paths(digest)?;
        self.hot.remove(digest);

        let (meta, body) = tokio::join!(remove_if_present(&paths.meta), remove_if_present(&paths.body));
        meta.and(body).map_err(Error::store_io(digest))?;

        tracing::debug!(digest, "cache entry purged");
        Ok(())
    }
}

async fn write_replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = temp_path(path);
    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("entry");
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::hash::compute_digest;

    fn test_store(root: &Path) -> CacheStore {
        CacheStore::new(StoreConfig::new(root))
    }

    fn test_entry(body: &'static str) -> OutgoingMessage {
        OutgoingMessage::new(200, [("Content-Type", "text/plain"), ("X-Origin", "mock")], body, MAX_BODY_BYTES)
            .unwrap()
    }

    #[test]
    fn test_entry_paths_are_sharded() {
        let digest = compute_digest("example.com/");
        let paths = EntryPaths::resolve(Path::new("/cache"), &digest).unwrap();
        assert_eq!(paths.dir, Path::new("/cache").join(&digest[0..2]).join(&digest[2..4]));
        assert_eq!(paths.body, paths.dir.join(&digest));
        assert_eq!(paths.meta, paths.dir.join(format!("{digest}.meta")));
    }

    #[test]
    fn test_entry_paths_reject_illegal_digest() {
        let result = EntryPaths::resolve(Path::new("/cache"), "../../etc/passwd");
        assert!(matches!(result, Err(Error::IllegalInput(_))));
    }

    #[tokio::test]
    async fn test_write_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/page");
        let entry = test_entry("hello");

        store.write(&digest, &entry).await.unwrap();
        let fetched = store.fetch(&digest).await.unwrap();

        assert_eq!(fetched.status(), 200);
        assert_eq!(fetched.body().as_ref(), b"hello");
        assert_eq!(fetched.header("content-type"), Some("text/plain"));
        assert_eq!(fetched.header("x-origin"), Some("mock"));
        assert_eq!(fetched, entry);
    }

    #[tokio::test]
    async fn test_fetch_reads_disk_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/raw");
        let paths = store.paths(&digest).unwrap();
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.body, b"raw body").unwrap();
        let meta = serde_json::json!({
            "hash": compute_checksum(b"raw body"),
            "more": { "status": 301, "headers": { "Location": "/elsewhere" } }
        });
        std::fs::write(&paths.meta, meta.to_string()).unwrap();

        let fetched = store.fetch(&digest).await.unwrap();
        assert_eq!(fetched.status(), 301);
        assert_eq!(fetched.header("location"), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn test_fetch_missing_is_store_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let result = store.fetch(&compute_digest("example.com/missing")).await;
        assert!(matches!(&result, Err(Error::StoreIo { .. })));
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_missing_meta_is_store_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/half");
        store.write(&digest, &test_entry("half")).await.unwrap();
        std::fs::remove_file(store.paths(&digest).unwrap().meta).unwrap();

        let result = store.fetch(&digest).await;
        assert!(matches!(result, Err(Error::StoreIo { .. })));
    }

    #[tokio::test]
    async fn test_fetch_garbled_meta_is_store_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/garbled");
        store.write(&digest, &test_entry("garbled")).await.unwrap();
        std::fs::write(store.paths(&digest).unwrap().meta, b"{not json").unwrap();

        let result = store.fetch(&digest).await;
        assert!(matches!(result, Err(Error::StoreIo { .. })));
    }

    #[tokio::test]
    async fn test_tampered_body_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/tamper");
        store.write(&digest, &test_entry("original")).await.unwrap();

        let body_path = store.paths(&digest).unwrap().body;
        std::fs::write(&body_path, b"tampered").unwrap();

        let result = store.fetch(&digest).await;
        assert!(matches!(result, Err(Error::Integrity(d)) if d == digest));
        assert!(body_path.exists(), "corrupt entry must stay until purged");
    }

    #[tokio::test]
    async fn test_hot_layer_serves_repeat_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/hot");
        store.write(&digest, &test_entry("hot")).await.unwrap();
        store.fetch(&digest).await.unwrap();

        std::fs::remove_file(store.paths(&digest).unwrap().body).unwrap();
        let fetched = store.fetch(&digest).await.unwrap();
        assert_eq!(fetched.body().as_ref(), b"hot");
    }

    #[tokio::test]
    async fn test_write_replaces_hot_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/replace");
        store.write(&digest, &test_entry("v1")).await.unwrap();
        store.fetch(&digest).await.unwrap();

        store.write(&digest, &test_entry("v2")).await.unwrap();
        let fetched = store.fetch(&digest).await.unwrap();
        assert_eq!(fetched.body().as_ref(), b"v2");
    }

    #[tokio::test]
    async fn test_purge_clears_both_layers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/purge");
        store.write(&digest, &test_entry("bye")).await.unwrap();
        store.fetch(&digest).await.unwrap();

        store.purge(&digest).await.unwrap();

        let paths = store.paths(&digest).unwrap();
        assert!(!paths.body.exists());
        assert!(!paths.meta.exists());
        assert!(store.fetch(&digest).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_purge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/twice");
        store.write(&digest, &test_entry("x")).await.unwrap();

        store.purge(&digest).await.unwrap();
        store.purge(&digest).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let digest = compute_digest("example.com/clean");
        store.write(&digest, &test_entry("clean")).await.unwrap();

        let paths = store.paths(&digest).unwrap();
        let names: Vec<_> = std::fs::read_dir(&paths.dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn test_illegal_digest_rejected_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        assert!(matches!(store.fetch("nope").await, Err(Error::IllegalInput(_))));
        assert!(matches!(store.write("nope", &test_entry("x")).await, Err(Error::IllegalInput(_))));
        assert!(matches!(store.purge("nope").await, Err(Error::IllegalInput(_))));
    }
}
