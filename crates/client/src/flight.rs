//! Single-flight coalescing of upstream fetches.
//!
//! A [`Flight`] owns the one outstanding upstream fetch for a digest. Every
//! request that misses the cache for that digest boards the same flight with
//! a [`Waiter`] callback; when the fetch lands, each waiter receives a clone
//! of the same response, in boarding order.
//!
//! The [`FlightRegistry`] guarantees at most one live flight per digest: the
//! lookup and the insert happen under a single lock acquisition with no
//! suspension point in between.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stampede_core::lock::mutex_lock;
use stampede_core::{IncomingMessage, OutgoingMessage};

use crate::fetch::UpstreamClient;

const SOURCE: &str = "flight";

/// Body of the response synthesized when the upstream times out or fails.
pub const GATEWAY_TIMEOUT_BODY: &str = "gateway timeout";

/// Callback receiving the terminal response of a flight.
pub type Waiter = Box<dyn FnOnce(OutgoingMessage) + Send + 'static>;

#[derive(Default)]
struct FlightState {
    waiters: Vec<Waiter>,
    running: bool,
    result: Option<OutgoingMessage>,
}

/// One outstanding upstream fetch and the requests waiting on it.
pub struct Flight {
    upstream: IncomingMessage,
    state: Mutex<FlightState>,
}

impl Flight {
    pub fn new(upstream: IncomingMessage) -> Self {
        Self { upstream, state: Mutex::new(FlightState::default()) }
    }

    /// The request that will be sent upstream.
    pub fn upstream(&self) -> &IncomingMessage {
        &self.upstream
    }

    /// Queue `waiter` for the terminal response.
    ///
    /// A waiter boarding after the fetch has landed is answered immediately
    /// with the same response.
    pub fn carry(&self, waiter: Waiter) {
        let mut state = mutex_lock(&self.state, SOURCE, "carry");
        if let Some(result) = state.result.clone() {
            drop(state);
            waiter(result);
            return;
        }
        state.waiters.push(waiter);
    }

    pub fn waiting(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "waiting").waiters.len()
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "is_running").running
    }

    /// Run the upstream fetch once and fan the result out.
    ///
    /// Returns `false` without doing anything if the flight is already
    /// running or has landed. Timeouts and transport failures become a 504
    /// with a fixed plaintext body. On completion every waiter is invoked in
    /// order, then `on_complete`, then the waiter queue and running flag are
    /// cleared.
    pub async fn start<F, Fut>(&self, client: &UpstreamClient, timeout: Duration, on_complete: F) -> bool
    where
        F: FnOnce(OutgoingMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "start");
            if state.running || state.result.is_some() {
                return false;
            }
            state.running = true;
        }

        let result = match client.fetch_with_timeout(&self.upstream, timeout).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    host = self.upstream.host().unwrap_or_default(),
                    url = %self.upstream.url,
                    error = %e,
                    "upstream fetch failed"
                );
                OutgoingMessage::text(504, GATEWAY_TIMEOUT_BODY)
            }
        };

        let waiters = {
            let mut state = mutex_lock(&self.state, SOURCE, "land");
            state.result = Some(result.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter(result.clone());
        }

        on_complete(result).await;

        let mut state = mutex_lock(&self.state, SOURCE, "finish");
        state.waiters.clear();
        state.running = false;
        true
    }
}

/// Registry of live flights keyed by digest.
#[derive(Default)]
pub struct FlightRegistry {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl FlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live flight for `digest`, creating it from `upstream` if
    /// there is none. The boolean is `true` when the flight was created.
    pub fn find_or_create(&self, digest: &str, upstream: IncomingMessage) -> (Arc<Flight>, bool) {
        let mut flights = mutex_lock(&self.flights, SOURCE, "find_or_create");
        if let Some(flight) = flights.get(digest) {
            return (Arc::clone(flight), false);
        }
        let flight = Arc::new(Flight::new(upstream));
        flights.insert(digest.to_string(), Arc::clone(&flight));
        (flight, true)
    }

    pub fn get(&self, digest: &str) -> Option<Arc<Flight>> {
        mutex_lock(&self.flights, SOURCE, "get").get(digest).cloned()
    }

    /// Remove `flight` from the registry. A different flight registered
    /// under the same digest is left alone.
    pub fn remove(&self, digest: &str, flight: &Arc<Flight>) -> bool {
        let mut flights = mutex_lock(&self.flights, SOURCE, "remove");
        match flights.get(digest) {
            Some(current) if Arc::ptr_eq(current, flight) => {
                flights.remove(digest);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.flights, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
