//! Client code for stampede.
//!
//! This crate provides the upstream fetch pipeline and the single-flight
//! engine that coalesces concurrent cache misses into one fetch per digest.

pub mod fetch;
pub mod flight;

pub use fetch::{FetchConfig, UpstreamClient, upstream_url};
pub use flight::{Flight, FlightRegistry, GATEWAY_TIMEOUT_BODY, Waiter};
