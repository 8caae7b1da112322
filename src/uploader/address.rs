//! # Content Addressing
//!
//! Telemetry documents are keyed by the SHA-256 of the base64 encoding of the
//! raw sentence, so every receiver that heard the same bytes writes to the
//! same document.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// Base64 encode raw telemetry (standard alphabet, no line breaks)
pub fn encode_raw(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

/// Document id for an already base64 encoded payload
///
/// # Examples
///
/// ```
/// use habitat_listener::uploader::address::id_for;
///
/// let id = id_for("JCRDQUxMLDEqMDEK");
/// assert_eq!(id.len(), 64);
/// ```
pub fn id_for(base64_payload: &str) -> String {
    hex::encode(Sha256::digest(base64_payload.as_bytes()))
}

/// Base64 payload and document id for raw telemetry
pub fn address(raw: &[u8]) -> (String, String) {
    let payload = encode_raw(raw);
    let doc_id = id_for(&payload);
    (payload, doc_id)
}
