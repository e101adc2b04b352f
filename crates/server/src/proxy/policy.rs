//! Extension points of the proxy.
//!
//! Each hook is a trait with default methods, so an implementation only
//! overrides what it cares about. [`DefaultPolicy`] implements all four with
//! the defaults: no rewrite, never skip the cache, always wait, never veto,
//! `public` for an hour.

use stampede_core::{IncomingMessage, OutgoingMessage};

/// Freshness stamped onto cacheable responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age_secs: u64,
    pub pragma: String,
}

impl CachePolicy {
    pub fn new(max_age_secs: u64, pragma: impl Into<String>) -> Self {
        Self { max_age_secs, pragma: pragma.into() }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(3600, "public")
    }
}

/// Rewrites requests before they are keyed and picks the upstream request.
pub trait RequestRewriter: Send + Sync {
    /// Adjust the request in place. Runs before the digest is computed.
    fn revise_request(&self, _request: &mut IncomingMessage) {}

    /// The request to send upstream; `None` means there is no upstream.
    fn infer_upstream(&self, request: &IncomingMessage) -> Option<IncomingMessage> {
        Some(request.clone())
    }
}

pub trait CachePolicyProvider: Send + Sync {
    /// Bypass the store entirely: no lookup, no write.
    fn must_skip_cache(&self, _request: &IncomingMessage) -> bool {
        false
    }

    /// `None` or a zero max-age keeps the response out of the store.
    fn cache_policy(&self, _request: &IncomingMessage, _response: &OutgoingMessage) -> Option<CachePolicy> {
        Some(CachePolicy::default())
    }
}

pub trait WaitPolicyProvider: Send + Sync {
    /// `false` answers a miss with 404 while the fetch fills the cache in
    /// the background.
    fn must_wait(&self, _request: &IncomingMessage) -> bool {
        true
    }
}

pub trait ErrorCacheabilityProvider: Send + Sync {
    /// Veto caching of a response whose status alone looks cacheable.
    fn will_emit_error(&self, _request: &IncomingMessage, _response: &OutgoingMessage) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl RequestRewriter for DefaultPolicy {}
impl CachePolicyProvider for DefaultPolicy {}
impl WaitPolicyProvider for DefaultPolicy {}
impl ErrorCacheabilityProvider for DefaultPolicy {}

/// Sends every request to one fixed origin by substituting its Host header.
#[derive(Debug, Clone)]
pub struct HostRewriter {
    upstream: String,
}

impl HostRewriter {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self { upstream: upstream.into() }
    }
}

impl RequestRewriter for HostRewriter {
    fn revise_request(&self, request: &mut IncomingMessage) {
        request.headers.insert("host".into(), self.upstream.clone());
    }
}
