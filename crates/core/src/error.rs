//! Unified error types for stampede.
//!
//! Every variant carries a stable code prefix so log lines stay greppable.

use std::io;

/// Unified error types for the stampede proxy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed digest, invalid status or oversized body.
    #[error("ILLEGAL_INPUT: {0}")]
    IllegalInput(String),

    /// Cache artifact missing, unreadable or unwritable.
    #[error("STORE_IO: {digest}: {source}")]
    StoreIo { digest: String, source: io::Error },

    /// Stored body does not match its recorded checksum.
    #[error("INTEGRITY: checksum mismatch for {0}")]
    Integrity(String),

    /// Metadata could not be encoded.
    #[error("SERIALIZATION: {0}")]
    Serialization(String),

    /// Upstream request failed before a response was read.
    #[error("UPSTREAM_ERROR: {0}")]
    Upstream(String),

    /// Upstream did not answer within the flight timeout.
    #[error("UPSTREAM_TIMEOUT: {0}")]
    UpstreamTimeout(String),
}

impl Error {
    pub(crate) fn store_io(digest: &str) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Error::StoreIo { digest: digest.to_string(), source }
    }

    /// True when the error only means "nothing is cached under this digest".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::StoreIo { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// HTTP status reported when this error reaches the proxy surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::IllegalInput(_) => 400,
            Error::StoreIo { .. } | Error::Integrity(_) | Error::Serialization(_) => 500,
            Error::Upstream(_) => 502,
            Error::UpstreamTimeout(_) => 504,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Integrity("abc123".to_string());
        assert!(err.to_string().contains("INTEGRITY"));
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_not_found_detection() {
        let missing = Error::store_io("abc")(io::Error::from(io::ErrorKind::NotFound));
        assert!(missing.is_not_found());

        let denied = Error::store_io("abc")(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_not_found());
        assert_eq!(denied.status_code(), 500);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::IllegalInput("x".into()).status_code(), 400);
        assert_eq!(Error::Upstream("x".into()).status_code(), 502);
        assert_eq!(Error::UpstreamTimeout("x".into()).status_code(), 504);
    }
}
