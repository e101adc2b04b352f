//! Digest and checksum computation.

use sha2::{Digest, Sha256};

use crate::Error;

/// Length of a hex-encoded digest.
pub const DIGEST_LEN: usize = 64;

/// Compute the cache digest for a request identity (`host + url`).
pub fn compute_digest(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

/// Compute the integrity checksum stored next to a cached body.
pub fn compute_checksum(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Reject anything that is not a lowercase hex digest.
///
/// Digests become path components, so this is also what keeps a purge from
/// escaping the store root.
pub fn validate_digest(digest: &str) -> Result<(), Error> {
    if digest.len() == DIGEST_LEN && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(Error::IllegalInput(format!("illegal digest {digest:?}")))
    }
}
