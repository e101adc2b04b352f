//! HTTP surface: every request, whatever its path, goes through the proxy.

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use stampede_core::{IncomingMessage, OutgoingMessage};

use crate::proxy::Proxy;

pub fn router(proxy: Proxy) -> Router {
    Router::new().fallback(forward).with_state(proxy)
}

async fn forward(State(proxy): State<Proxy>, method: Method, uri: Uri, headers: HeaderMap) -> Response {
    let request = incoming(&method, &uri, &headers);
    tracing::debug!(method = %request.method, url = %request.url, "request");
    into_response(proxy.handle(request).await)
}

/// Headers that are not valid UTF-8 are dropped. Absolute-form request
/// targets supply the Host when the header is missing.
fn incoming(method: &Method, uri: &Uri, headers: &HeaderMap) -> IncomingMessage {
    let url = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect();
    if !headers.contains_key(HOST)
        && let Some(authority) = uri.authority()
    {
        pairs.push((HOST.as_str().to_string(), authority.to_string()));
    }
    IncomingMessage::new(method.as_str(), url, pairs)
}

fn into_response(message: OutgoingMessage) -> Response {
    let mut response = Response::new(Body::from(message.body().clone()));
    *response.status_mut() = StatusCode::from_u16(message.status()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = response.headers_mut();
    for (name, value) in message.headers() {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    response
}
