//! Small shared helpers: id minting and ETag hashing.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Mint an opaque, URL-safe, server-side identifier.
///
/// Ids are never reused after deletion within a process lifetime; a random
/// v4 UUID satisfies that without bookkeeping.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The AF-unique certificate identifier shipped over M3.
pub fn af_unique_certificate_id(provisioning_session_id: &str, certificate_id: &str) -> String {
    format!("{provisioning_session_id}:{certificate_id}")
}

/// Strong ETag (quoted lowercase hex SHA-256) of a canonical JSON body.
pub fn etag_for(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Compare an `If-Match`/`If-None-Match` header value against a current
/// ETag using weak comparison (strip a leading `W/` from either side).
pub fn etag_matches(header_value: &str, current_etag: &str) -> bool {
    header_value
        .split(',')
        .map(str::trim)
        .any(|candidate| strip_weak(candidate) == strip_weak(current_etag) || candidate == "*")
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn af_unique_id_has_expected_form() {
        assert_eq!(af_unique_certificate_id("ps1", "cert1"), "ps1:cert1");
    }

    #[test]
    fn etag_is_stable_for_identical_bodies() {
        let a = etag_for(b"{\"a\":1}");
        let b = etag_for(b"{\"a\":1}");
        let c = etag_for(b"{\"a\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn etag_matches_handles_weak_prefix_and_lists() {
        let current = etag_for(b"body");
        assert!(etag_matches(&current, &current));
        assert!(etag_matches(&format!("W/{current}"), &current));
        assert!(etag_matches(&format!("\"stale\", {current}"), &current));
        assert!(!etag_matches("\"stale\"", &current));
        assert!(etag_matches("*", &current));
    }
}
