//! Upstream fetch pipeline.
//!
//! ### Request
//! - `GET http://<host><url>` built from the (possibly rewritten) request
//! - Original request headers are forwarded, minus connection-scoped ones
//! - Redirects are never followed; 3xx responses are relayed as-is
//!
//! ### Response
//! - Body bounded by `max_bytes` (checked on Content-Length and on read)
//! - Header names lowercased, connection-scoped headers dropped
//! - Bodies are relayed verbatim (no transparent decompression)

pub mod url;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub use url::{UrlError, upstream_url};

use stampede_core::message::{MAX_BODY_BYTES, is_connection_header};
use stampede_core::{Action, Error, IncomingMessage, Metrics, OutgoingMessage, Volume};

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent used when the client did not send one (default: "stampede/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 64MB)
    pub max_bytes: usize,

    /// Connect timeout; the overall deadline is set per flight (default: 5s)
    pub connect_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "stampede/0.1".to_string(),
            max_bytes: MAX_BODY_BYTES,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP client for the origin.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    config: FetchConfig,
    metrics: Option<Arc<Metrics>>,
}

impl UpstreamClient {
    /// Create a new upstream client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Upstream(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config, metrics: None })
    }

    /// Record fetch counts and byte volumes into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch `upstream` with a GET, returning the response as a message.
    ///
    /// Any status is a successful fetch; only transport failures and
    /// oversized bodies are errors.
    pub async fn fetch(&self, upstream: &IncomingMessage) -> Result<OutgoingMessage, Error> {
        let start = Instant::now();
        let url = upstream_url(upstream).map_err(|e| Error::Upstream(e.to_string()))?;
        self.record(Action::UpstreamFetch);

        let response = self
            .http
            .get(url.as_str())
            .headers(forwarded_headers(upstream))
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("network error: {e}")))?;

        let status = response.status();

        if let Some(len) = response.content_length()
            && len > self.config.max_bytes as u64
        {
            return Err(Error::Upstream(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("failed to read response: {e}")))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_bytes(Volume::UpstreamFetch, bytes.len());
        }

        let message = OutgoingMessage::new(status.as_u16(), headers, bytes, self.config.max_bytes)?;

        tracing::debug!(
            "fetched {} -> {} in {}ms ({} bytes)",
            url,
            status.as_u16(),
            start.elapsed().as_millis(),
            message.body().len()
        );

        Ok(message)
    }

    /// [`fetch`](Self::fetch) bounded by `timeout`.
    ///
    /// On timeout the in-flight request is dropped, which releases its connection.
    pub async fn fetch_with_timeout(
        &self, upstream: &IncomingMessage, timeout: Duration,
    ) -> Result<OutgoingMessage, Error> {
        match tokio::time::timeout(timeout, self.fetch(upstream)).await {
            Ok(result) => result,
            Err(_) => {
                self.record(Action::UpstreamTimeout);
                Err(Error::UpstreamTimeout(format!(
                    "{}{} after {}ms",
                    upstream.host().unwrap_or_default(),
                    upstream.url,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    fn record(&self, action: Action) {
        if let Some(metrics) = &self.metrics {
            metrics.record(action);
        }
    }
}

/// Request headers sent upstream: everything but connection-scoped headers and Host,
/// which is carried by the URL.
fn forwarded_headers(message: &IncomingMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &message.headers {
        if name == "host" || is_connection_header(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_to(server: &MockServer, url: &str) -> IncomingMessage {
        IncomingMessage::new("GET", url, [("host", server.address().to_string()), ("x-trace", "abc".to_string())])
    }

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "stampede/0.1");
        assert_eq!(config.max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_forwarded_headers_skip_connection_scoped() {
        let message = IncomingMessage::new(
            "GET",
            "/",
            [("Host", "example.com"), ("Connection", "keep-alive"), ("Accept", "text/html")],
        );
        let headers = forwarded_headers(&message);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }

    #[tokio::test]
    async fn test_fetch_client_new() {
        let client = UpstreamClient::new(FetchConfig::default());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_relays_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("x-trace", "abc"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing").insert_header("X-Origin", "mock"))
            .mount(&server)
            .await;

        let metrics = Arc::new(Metrics::default());
        let client = UpstreamClient::new(FetchConfig::default()).unwrap().with_metrics(Arc::clone(&metrics));
        let response = client.fetch(&request_to(&server, "/page")).await.unwrap();

        assert_eq!(response.status(), 404);
        assert_eq!(response.body().as_ref(), b"missing");
        assert_eq!(response.header("x-origin"), Some("mock"));
        assert_eq!(metrics.current(Action::UpstreamFetch), 1);
        assert_eq!(metrics.current_bytes(Volume::UpstreamFetch), 7);
    }

    #[tokio::test]
    async fn test_fetch_does_not_follow_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(FetchConfig::default()).unwrap();
        let response = client.fetch(&request_to(&server, "/old")).await.unwrap();
        assert_eq!(response.status(), 301);
        assert_eq!(response.header("location"), Some("/new"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
            .mount(&server)
            .await;

        let config = FetchConfig { max_bytes: 16, ..Default::default() };
        let client = UpstreamClient::new(config).unwrap();
        let result = client.fetch(&request_to(&server, "/big")).await;
        assert!(matches!(result, Err(Error::Upstream(_)) | Err(Error::IllegalInput(_))));
    }

    #[tokio::test]
    async fn test_fetch_with_timeout_expires() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let metrics = Arc::new(Metrics::default());
        let client = UpstreamClient::new(FetchConfig::default()).unwrap().with_metrics(Arc::clone(&metrics));
        let result = client
            .fetch_with_timeout(&request_to(&server, "/slow"), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(Error::UpstreamTimeout(_))));
        assert_eq!(metrics.current(Action::UpstreamTimeout), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_host_fails() {
        let client = UpstreamClient::new(FetchConfig::default()).unwrap();
        let request = IncomingMessage::new("GET", "/", Vec::<(&str, &str)>::new());
        let result = client.fetch(&request).await;
        assert!(matches!(result, Err(Error::Upstream(_))));
    }
}
