//! The request lifecycle.
//!
//! ```text
//! received ─┬─ DELETE ──────────────── purge + broadcast ── 200
//!           ├─ other than GET ──────────────────────────── 405
//!           └─ GET ── lookup ─┬─ fresh hit ─────────────── cached response
//!                             └─ miss / expired (purged) ── flight ── upstream response
//! ```
//!
//! Policy decisions are delegated to the hook traits in [`policy`]; the
//! lifecycle itself is fixed.

pub mod policy;


use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stampede_client::{Flight, FlightRegistry, GATEWAY_TIMEOUT_BODY, UpstreamClient};
use stampede_core::fingerprint::DEFAULT_FINGERPRINT_CAPACITY;
use stampede_core::{Action, CacheStore, Error, Fingerprints, IncomingMessage, Metrics, OutgoingMessage, Volume};
use tokio::sync::oneshot;

use crate::bridge::{Bridge, PURGE_CACHE};

pub use policy::{
    CachePolicy, CachePolicyProvider, DefaultPolicy, ErrorCacheabilityProvider, HostRewriter, RequestRewriter,
    WaitPolicyProvider,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const UPSTREAM_NOT_PROVIDED: &str = "upstream not provided";

pub const METHOD_NOT_ALLOWED: &str = "method not allowed";

/// Caching, coalescing reverse proxy. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CacheStore>,
    client: UpstreamClient,
    fingerprints: Fingerprints,
    flights: FlightRegistry,
    bridge: Arc<Bridge>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    rewriter: Arc<dyn RequestRewriter>,
    cache_policy: Arc<dyn CachePolicyProvider>,
    wait_policy: Arc<dyn WaitPolicyProvider>,
    error_policy: Arc<dyn ErrorCacheabilityProvider>,
}

/// Removes a flight from the registry when dropped, including on unwind.
struct Deregister<'a> {
    flights: &'a FlightRegistry,
    digest: &'a str,
    flight: &'a Arc<Flight>,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        self.flights.remove(self.digest, self.flight);
    }
}

/// Assembles a [`Proxy`]; every hook defaults to [`DefaultPolicy`].
pub struct ProxyBuilder {
    store: Arc<CacheStore>,
    client: UpstreamClient,
    fingerprint_capacity: NonZeroUsize,
    bridge: Arc<Bridge>,
    metrics: Arc<Metrics>,
    timeout: Duration,
    rewriter: Arc<dyn RequestRewriter>,
    cache_policy: Arc<dyn CachePolicyProvider>,
    wait_policy: Arc<dyn WaitPolicyProvider>,
    error_policy: Arc<dyn ErrorCacheabilityProvider>,
}

impl ProxyBuilder {
    pub fn fingerprint_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.fingerprint_capacity = capacity;
        self
    }

    pub fn bridge(mut self, bridge: Arc<Bridge>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Deadline for each upstream fetch.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rewriter(mut self, rewriter: Arc<dyn RequestRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn cache_policy(mut self, provider: Arc<dyn CachePolicyProvider>) -> Self {
        self.cache_policy = provider;
        self
    }

    pub fn wait_policy(mut self, provider: Arc<dyn WaitPolicyProvider>) -> Self {
        self.wait_policy = provider;
        self
    }

    pub fn error_policy(mut self, provider: Arc<dyn ErrorCacheabilityProvider>) -> Self {
        self.error_policy = provider;
        self
    }

    pub fn build(self) -> Proxy {
        Proxy {
            inner: Arc::new(Inner {
                store: self.store,
                client: self.client,
                fingerprints: Fingerprints::new(self.fingerprint_capacity),
                flights: FlightRegistry::new(),
                bridge: self.bridge,
                metrics: self.metrics,
                timeout: self.timeout,
                rewriter: self.rewriter,
                cache_policy: self.cache_policy,
                wait_policy: self.wait_policy,
                error_policy: self.error_policy,
            }),
        }
    }
}

impl Proxy {
    pub fn builder(store: Arc<CacheStore>, client: UpstreamClient) -> ProxyBuilder {
        ProxyBuilder {
            store,
            client,
            fingerprint_capacity: NonZeroUsize::new(DEFAULT_FINGERPRINT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            bridge: Arc::new(Bridge::new()),
            metrics: Arc::new(Metrics::default()),
            timeout: DEFAULT_TIMEOUT,
            rewriter: Arc::new(DefaultPolicy),
            cache_policy: Arc::new(DefaultPolicy),
            wait_policy: Arc::new(DefaultPolicy),
            error_policy: Arc::new(DefaultPolicy),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Answer one request. Never fails: every error becomes a status.
    pub async fn handle(&self, mut request: IncomingMessage) -> OutgoingMessage {
        self.inner.metrics.record(Action::Total);
        self.inner.rewriter.revise_request(&mut request);
        let digest = self.inner.fingerprints.digest(&request.identity());

        match request.method.as_str() {
            "DELETE" => self.purge(&digest).await,
            "GET" => self.serve(request, digest).await,
            method => {
                tracing::debug!(method, url = %request.url, "rejecting method");
                OutgoingMessage::text(405, METHOD_NOT_ALLOWED)
            }
        }
    }

    async fn serve(&self, request: IncomingMessage, digest: String) -> OutgoingMessage {
        if !self.inner.cache_policy.must_skip_cache(&request)
            && let Some(cached) = self.lookup(&digest).await
        {
            return cached;
        }
        self.miss(request, digest).await
    }

    /// Fresh cached response for `digest`, if any. Expired entries are purged.
    async fn lookup(&self, digest: &str) -> Option<OutgoingMessage> {
        let metrics = &self.inner.metrics;
        metrics.record(Action::CacheFetch);

        match self.inner.store.fetch(digest).await {
            Ok(cached) if cached.expired() => {
                tracing::debug!(digest, "cache entry expired");
                let _ = self.purge_local(digest).await;
                None
            }
            Ok(cached) => {
                metrics.record_bytes(Volume::CacheFetch, cached.body().len());
                tracing::debug!(digest, status = cached.status(), "cache hit");
                Some(cached)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(digest, "cache miss");
                None
            }
            Err(e) => {
                metrics.record(Action::CacheFetchError);
                tracing::warn!(digest, error = %e, "cache lookup failed, fetching upstream");
                None
            }
        }
    }

    async fn miss(&self, request: IncomingMessage, digest: String) -> OutgoingMessage {
        let inner = &self.inner;
        let upstream = inner.rewriter.infer_upstream(&request).filter(|upstream| upstream.host().is_some());

        let (flight, created) = match upstream {
            Some(upstream) => inner.flights.find_or_create(&digest, upstream),
            None => match inner.flights.get(&digest) {
                Some(flight) => (flight, false),
                None => return OutgoingMessage::text(500, UPSTREAM_NOT_PROVIDED),
            },
        };
        if created {
            inner.metrics.record(Action::FlightCreated);
        }

        if !inner.wait_policy.must_wait(&request) {
            if created {
                self.launch(digest, flight, request);
            }
            return OutgoingMessage::text(404, "");
        }

        let (tx, rx) = oneshot::channel();
        let proxy = self.clone();
        let waiter_request = request.clone();
        flight.carry(Box::new(move |mut response| {
            if let Some(policy) = proxy.cache_policy_for(&waiter_request, &response) {
                response.set_cache_headers(policy.max_age_secs, &policy.pragma);
            }
            let _ = tx.send(response);
        }));
        inner.metrics.record(Action::WaiterInserted);

        if created {
            self.launch(digest, flight, request);
        }
        rx.await.unwrap_or_else(|_| OutgoingMessage::text(504, GATEWAY_TIMEOUT_BODY))
    }

    /// Run `flight` on its own task so a disconnecting requester cannot
    /// cancel it for the others.
    fn launch(&self, digest: String, flight: Arc<Flight>, request: IncomingMessage) {
        let proxy = self.clone();
        tokio::spawn(async move {
            let inner = &proxy.inner;
            let _deregister = Deregister { flights: &inner.flights, digest: &digest, flight: &flight };
            flight
                .start(&inner.client, inner.timeout, |response| proxy.complete(&digest, &request, response))
                .await;
        });
    }

    /// Persist a landed response when it is cacheable.
    async fn complete(&self, digest: &str, request: &IncomingMessage, mut response: OutgoingMessage) {
        let Some(policy) = self.cache_policy_for(request, &response) else {
            tracing::debug!(digest, status = response.status(), "response not cacheable");
            return;
        };
        response.set_cache_headers(policy.max_age_secs, &policy.pragma);

        let metrics = &self.inner.metrics;
        metrics.record(Action::CacheWrite);
        match self.inner.store.write(digest, &response).await {
            Ok(()) => metrics.record_bytes(Volume::CacheWrite, response.body().len()),
            Err(e) => {
                metrics.record(Action::CacheWriteError);
                tracing::warn!(digest, error = %e, "failed to persist response");
            }
        }
    }

    /// Status in [200, 400) and not vetoed by the error hook.
    fn is_cacheable(&self, request: &IncomingMessage, response: &OutgoingMessage) -> bool {
        response.has_cacheable_status() && !self.inner.error_policy.will_emit_error(request, response)
    }

    fn cache_policy_for(&self, request: &IncomingMessage, response: &OutgoingMessage) -> Option<CachePolicy> {
        let hooks = &self.inner.cache_policy;
        if hooks.must_skip_cache(request) || !self.is_cacheable(request, response) {
            return None;
        }
        hooks.cache_policy(request, response).filter(|policy| policy.max_age_secs > 0)
    }

    /// Purge locally and tell every sibling. Siblings are told even when the
    /// local purge failed.
    async fn purge(&self, digest: &str) -> OutgoingMessage {
        let local = self.purge_local(digest).await;
        self.inner.bridge.send_message(PURGE_CACHE, json!({ "digest": digest })).await;

        match local {
            Ok(()) => OutgoingMessage::text(200, &format!("{digest} purged")),
            Err(e) => OutgoingMessage::text(e.status_code(), &e.to_string()),
        }
    }

    async fn purge_local(&self, digest: &str) -> Result<(), Error> {
        let metrics = &self.inner.metrics;
        metrics.record(Action::CachePurge);
        self.inner.store.purge(digest).await.inspect_err(|e| {
            metrics.record(Action::CachePurgeError);
            tracing::warn!(digest, error = %e, "purge failed");
        })
    }
}
