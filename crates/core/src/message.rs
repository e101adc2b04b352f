//! Normalized request and response messages.
//!
//! Both sides of the proxy speak these types: the HTTP surface converts into
//! [`IncomingMessage`], the store and the upstream client produce
//! [`OutgoingMessage`]. Header names are always lowercase.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

use crate::Error;

/// Default upper bound for a cached body (64MB).
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Lowercased header map. Repeated headers are folded into one value.
pub type Headers = BTreeMap<String, String>;

/// Headers that describe a single connection and never travel through the proxy.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Whether a header is connection-scoped and must be stripped when relaying.
pub fn is_connection_header(name: &str) -> bool {
    CONNECTION_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn normalize_headers<K, V>(headers: impl IntoIterator<Item = (K, V)>) -> Headers
where
    K: AsRef<str>,
    V: Into<String>,
{
    let mut normalized = Headers::new();
    for (name, value) in headers {
        let name = name.as_ref().to_ascii_lowercase();
        let value = value.into();
        normalized
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    normalized
}

/// Format a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an HTTP date, accepting IMF-fixdate and general RFC 2822 forms.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc2822(value).ok().map(|dt| dt.with_timezone(&Utc))
}

/// A request as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Uppercased method name.
    pub method: String,
    /// Path and query, as received.
    pub url: String,
    pub headers: Headers,
}

impl IncomingMessage {
    pub fn new<K, V>(method: &str, url: impl Into<String>, headers: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self { method: method.to_ascii_uppercase(), url: url.into(), headers: normalize_headers(headers) }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").filter(|h| !h.is_empty())
    }

    /// Request identity used for cache keys: `host + url`.
    ///
    /// Scheme and port are only part of it through the Host header.
    pub fn identity(&self) -> String {
        format!("{}{}", self.host().unwrap_or_default(), self.url)
    }
}

/// A response, either fetched upstream, loaded from the store or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl OutgoingMessage {
    /// Build a validated response.
    ///
    /// # Errors
    ///
    /// Returns `Error::IllegalInput` if the status is not a valid HTTP status
    /// or the body exceeds `max_body` bytes.
    pub fn new<K, V>(
        status: u16, headers: impl IntoIterator<Item = (K, V)>, body: impl Into<Bytes>, max_body: usize,
    ) -> Result<Self, Error>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        if !(100..=999).contains(&status) {
            return Err(Error::IllegalInput(format!("illegal status {status}")));
        }
        let body = body.into();
        if body.len() > max_body {
            return Err(Error::IllegalInput(format!("illegal body: {} bytes exceeds {max_body}", body.len())));
        }
        let mut headers = normalize_headers(headers);
        headers.retain(|name, _| !is_connection_header(name));
        Ok(Self { status, headers, body })
    }

    /// Synthesize a short plaintext response. The body always ends with CRLF.
    pub fn text(status: u16, text: &str) -> Self {
        let mut body = text.to_string();
        if !body.ends_with("\r\n") {
            body.push_str("\r\n");
        }
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "text/plain; charset=utf-8".into());
        Self { status, headers, body: Bytes::from(body) }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Status is in the cacheable range `[200, 400)`.
    pub fn has_cacheable_status(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Whether the `expires` header lies in the past.
    ///
    /// Missing or unparseable values never expire.
    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.header("expires")
            .and_then(parse_http_date)
            .is_some_and(|expires| now > expires)
    }

    /// Stamp caching headers for `max_age_secs`; zero leaves the message untouched.
    pub fn set_cache_headers(&mut self, max_age_secs: u64, pragma: &str) {
        self.set_cache_headers_at(max_age_secs, pragma, Utc::now());
    }

    pub fn set_cache_headers_at(&mut self, max_age_secs: u64, pragma: &str, now: DateTime<Utc>) {
        if max_age_secs == 0 {
            return;
        }
        let expires = i64::try_from(max_age_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|max_age| now.checked_add_signed(max_age))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set_header("cache-control", format!("{pragma}, max-age={max_age_secs}"));
        self.set_header("expires", format_http_date(expires));
        self.set_header("last-modified", format_http_date(now));
        self.set_header("pragma", pragma);
    }
}
