//! Upstream URL construction from a proxied request.

use stampede_core::IncomingMessage;

/// Error type for upstream URL construction failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("request has no Host header")]
    MissingHost,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Build the upstream URL for `message`: `http://<host><url>`.
///
/// Normalization steps:
/// 1. Require a non-empty Host header
/// 2. Treat a URL without a leading slash as relative to `/`
/// 3. Lowercase the host (via URL parsing)
/// 4. Remove fragment (#...)
/// 5. Keep query string intact (do not reorder)
pub fn upstream_url(message: &IncomingMessage) -> Result<url::Url, UrlError> {
    let host = message.host().map(str::trim).filter(|h| !h.is_empty()).ok_or(UrlError::MissingHost)?;

    let path = if message.url.starts_with('/') { message.url.clone() } else { format!("/{}", message.url) };
    let mut parsed =
        url::Url::parse(&format!("http://{host}{path}")).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    if parsed.host_str().is_none() {
        return Err(UrlError::InvalidUrl(format!("no host in {host}")));
    }

    parsed.set_fragment(None);

    Ok(parsed)
}
