//! Disk-backed cache for upstream responses.
//!
//! This module provides a persistent, content-addressed cache on the local
//! filesystem. It supports:
//!
//! - Digest-keyed storage sharded as `<root>/<aa>/<bb>/<digest>`
//! - Checksum verification of every body read from disk
//! - A bounded, short-lived hot layer in front of the disk
//! - Idempotent purges shared safely between sibling processes

pub mod hash;
pub mod hot;
pub mod store;

pub use crate::Error;

pub use hash::{compute_checksum, compute_digest, validate_digest};
pub use hot::HotCache;
pub use store::{CacheStore, EntryPaths, StoreConfig};
