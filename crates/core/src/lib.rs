//! Core types and shared functionality for stampede.
//!
//! This crate provides:
//! - The normalized request/response model
//! - Disk-backed, checksum-verified cache store with a bounded hot layer
//! - Request fingerprinting (digest memoization)
//! - Unified error types
//! - Configuration structures
//! - An owned metrics sink

pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod message;
pub mod metrics;

pub use cache::{CacheStore, StoreConfig};
pub use error::Error;
pub use fingerprint::Fingerprints;
pub use message::{Headers, IncomingMessage, OutgoingMessage};
pub use metrics::{Action, Metrics, Volume};
