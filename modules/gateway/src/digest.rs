//! Payload checksums and the deterministic message-id fallback.

use sha2::{Digest, Sha256};

/// Deterministic message id for deliveries the broker did not tag.
///
/// `"SHA256:" + lowercase hex of SHA-256(address || payload)`, byte-stable
/// so repeated deliveries of the same body collapse onto one raw-event row.
pub fn fingerprint(address: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(payload.as_bytes());
    format!("SHA256:{}", hex::encode(hasher.finalize()))
}

/// Lowercase hex MD5 of the payload, stored alongside every raw event.
pub fn checksum(payload: &str) -> String {
    format!("{:x}", md5::compute(payload.as_bytes()))
}
