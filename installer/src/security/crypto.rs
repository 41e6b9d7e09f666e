// Hashing utilities
//
// Secrets are never logged; these digests let logs and reports show *which* credential value
// is in play (e.g. "preserved DB_PASSWORD sha256:1a2b3c4d5e6f") without revealing it.

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::models::secrets::{SecretBundle, SecretKey};

const FINGERPRINT_HEX_CHARS: usize = 12;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    Sha256::digest(input)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Short, log-safe fingerprint of a secret value.
pub fn secret_fingerprint(value: &str) -> String {
    if value.is_empty() {
        return "empty".to_string();
    }
    let hex = sha256_hex(value.as_bytes());
    format!("sha256:{}", &hex[..FINGERPRINT_HEX_CHARS])
}

/// Fingerprints for every populated key in a bundle.
pub fn bundle_fingerprints(bundle: &SecretBundle) -> Vec<(SecretKey, String)> {
    bundle
        .iter()
        .map(|(k, v)| (k, secret_fingerprint(v)))
        .collect()
}

/// Content digest of a descriptor file (base64 SHA-256), used to tell whether a write changed it.
pub fn content_digest(content: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(content))
}
