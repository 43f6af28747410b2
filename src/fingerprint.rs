//! Request fingerprints used as cache keys.

use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic identity of a cacheable request.
///
/// SHA-256 over the length-prefixed request path (including any query string)
/// followed by the raw body. The length prefix keeps `("/ab", "c")` and
/// `("/a", "bc")` apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(path_and_query: &str, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((path_and_query.len() as u64).to_be_bytes());
        hasher.update(path_and_query.as_bytes());
        hasher.update(body);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, used as the shared-store key
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}
