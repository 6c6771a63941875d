use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Short SHA-256 fingerprint of record text, for edit detection.
pub fn content_fingerprint(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    digest[..FINGERPRINT_LEN].to_string()
}

/// Fingerprint of a JSON payload. Object keys serialize in sorted order,
/// so equal payloads always produce equal fingerprints.
pub fn payload_fingerprint(payload: &serde_json::Value) -> String {
    content_fingerprint(&payload.to_string())
}
