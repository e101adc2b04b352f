//! stampede server: the proxy orchestrator, the invalidation bridge and the
//! HTTP surface that ties them to a socket.

pub mod bridge;
pub mod error;
pub mod http;
pub mod proxy;

pub use bridge::{Bridge, BridgeMessage, PurgeHandler, UdpTransport};
pub use error::BridgeError;
pub use proxy::{Proxy, ProxyBuilder};
