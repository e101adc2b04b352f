//! Cross-process cache invalidation.
//!
//! Processes sharing one store root tell each other about purges so no
//! sibling keeps serving a stale hot entry. There is no coordinator: every
//! process broadcasts to every configured sibling and applies what it
//! receives. Delivery is best effort.
//!
//! Wire format (one JSON object per datagram):
//!
//! ```json
//! {"action":"purge-cache","payload":{"digest":"<64 hex chars>"}}
//! ```

pub mod udp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stampede_core::{Action, CacheStore, Metrics};

use crate::error::BridgeError;

pub use udp::UdpTransport;

/// The only action currently exchanged between siblings.
pub const PURGE_CACHE: &str = "purge-cache";

/// A message exchanged between sibling processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl BridgeMessage {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self { action: action.into(), payload }
    }

    pub fn purge(digest: &str) -> Self {
        Self::new(PURGE_CACHE, json!({ "digest": digest }))
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

/// Delivers messages to sibling processes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Addresses of every sibling reachable through this transport.
    fn peers(&self) -> Vec<String>;

    async fn send(&self, peer: &str, message: &BridgeMessage) -> Result<(), BridgeError>;
}

/// Applies one inbound action locally.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> Result<(), BridgeError>;
}

/// Fan-out sender and inbound dispatcher.
///
/// A bridge without transports is a no-op sender.
#[derive(Default)]
pub struct Bridge {
    transports: Vec<Arc<dyn Transport>>,
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Register the handler run when a sibling sends `action`.
    pub fn on(mut self, action: &str, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.insert(action.to_string(), handler);
        self
    }

    pub fn has_transports(&self) -> bool {
        !self.transports.is_empty()
    }

    /// Send `action` to every sibling on every transport.
    ///
    /// Returns the number of successful deliveries. Failures are logged per
    /// recipient and never abort the fan-out.
    pub async fn send_message(&self, action: &str, payload: Value) -> usize {
        let message = BridgeMessage::new(action, payload);
        let mut delivered = 0;
        for transport in &self.transports {
            for peer in transport.peers() {
                match transport.send(&peer, &message).await {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::warn!(peer, action, error = %e, "bridge delivery failed"),
                }
            }
        }
        delivered
    }

    /// Dispatch an inbound message to its handler.
    ///
    /// Returns `true` when a handler ran successfully. Unknown actions are
    /// logged and dropped.
    pub async fn receive(&self, message: BridgeMessage) -> bool {
        let Some(handler) = self.handlers.get(&message.action) else {
            tracing::debug!(action = %message.action, "dropping bridge message with unknown action");
            return false;
        };
        match handler.handle(&message.payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(action = %message.action, error = %e, "bridge handler failed");
                false
            }
        }
    }
}

/// Purges the local copy of an entry a sibling purged.
///
/// Never re-broadcasts.
pub struct PurgeHandler {
    store: Arc<CacheStore>,
    metrics: Arc<Metrics>,
}

impl PurgeHandler {
    pub fn new(store: Arc<CacheStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }
}

#[async_trait]
impl ActionHandler for PurgeHandler {
    async fn handle(&self, payload: &Value) -> Result<(), BridgeError> {
        let digest = payload
            .get("digest")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Decode("purge-cache payload has no digest".into()))?;

        self.metrics.record(Action::CachePurge);
        self.store.purge(digest).await.map_err(|e| {
            self.metrics.record(Action::CachePurgeError);
            BridgeError::Handler { action: PURGE_CACHE.into(), reason: e.to_string() }
        })?;

        tracing::debug!(digest, "purged on sibling request");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_core::{OutgoingMessage, StoreConfig, cache::compute_digest};
    use std::io;
    use std::sync::Mutex;

    /// Transport recording every delivery; peers named `down*` fail.
    #[derive(Default)]
    struct RecordingTransport {
        peers: Vec<String>,
        sent: Mutex<Vec<(String, BridgeMessage)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn peers(&self) -> Vec<String> {
            self.peers.clone()
        }

        async fn send(&self, peer: &str, message: &BridgeMessage) -> Result<(), BridgeError> {
            if peer.starts_with("down") {
                return Err(BridgeError::Send { peer: peer.into(), source: io::Error::other("unreachable") });
            }
            self.sent.lock().unwrap().push((peer.to_string(), message.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_message_wire_format() {
        let message = BridgeMessage::purge("abc");
        let json: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json, json!({"action": "purge-cache", "payload": {"digest": "abc"}}));

        let decoded = BridgeMessage::decode(br#"{"action":"purge-cache","payload":{"digest":"abc"}}"#).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(BridgeMessage::decode(b"not json"), Err(BridgeError::Decode(_))));
        assert!(matches!(BridgeMessage::decode(br#"{"payload":{}}"#), Err(BridgeError::Decode(_))));
    }

    #[tokio::test]
    async fn test_default_bridge_is_noop() {
        let bridge = Bridge::new();
        assert!(!bridge.has_transports());
        assert_eq!(bridge.send_message(PURGE_CACHE, json!({"digest": "x"})).await, 0);
    }

    #[tokio::test]
    async fn test_send_message_skips_failed_peers() {
        let transport = Arc::new(RecordingTransport {
            peers: vec!["a".into(), "down".into(), "b".into()],
            ..Default::default()
        });
        let bridge = Bridge::new().with_transport(transport.clone());

        let delivered = bridge.send_message(PURGE_CACHE, json!({"digest": "d"})).await;
        assert_eq!(delivered, 2);

        let sent = transport.sent.lock().unwrap();
        let peers: Vec<_> = sent.iter().map(|(peer, _)| peer.as_str()).collect();
        assert_eq!(peers, vec!["a", "b"]);
        assert_eq!(sent[0].1, BridgeMessage::purge("d"));
    }

    #[tokio::test]
    async fn test_receive_purges_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(StoreConfig::new(dir.path())));
        let metrics = Arc::new(Metrics::default());
        let digest = compute_digest("example.com/page");
        store.write(&digest, &OutgoingMessage::text(200, "cached")).await.unwrap();

        let transport = Arc::new(RecordingTransport { peers: vec!["a".into()], ..Default::default() });
        let bridge = Bridge::new()
            .with_transport(transport.clone())
            .on(PURGE_CACHE, Arc::new(PurgeHandler::new(Arc::clone(&store), Arc::clone(&metrics))));

        assert!(bridge.receive(BridgeMessage::purge(&digest)).await);
        assert!(store.fetch(&digest).await.unwrap_err().is_not_found());
        assert_eq!(metrics.current(Action::CachePurge), 1);
        assert!(transport.sent.lock().unwrap().is_empty());

        // idempotent
        assert!(bridge.receive(BridgeMessage::purge(&digest)).await);
    }

    #[tokio::test]
    async fn test_receive_rejects_bad_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CacheStore::new(StoreConfig::new(dir.path())));
        let bridge = Bridge::new().on(PURGE_CACHE, Arc::new(PurgeHandler::new(store, Arc::new(Metrics::default()))));

        assert!(!bridge.receive(BridgeMessage::new(PURGE_CACHE, json!({}))).await);
        assert!(!bridge.receive(BridgeMessage::purge("NOT-A-DIGEST")).await);
        assert!(!bridge.receive(BridgeMessage::new("reload", json!({}))).await);
    }
}
