//! Content Protocols Discovery document: a static JSON blob embedded at
//! build time, with an ETag/Last-Modified pair fixed for the lifetime of
//! the binary.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};

use crate::util::etag_for;

const DOCUMENT: &str = include_str!("content_protocols.json");

pub struct ContentProtocolsDocument {
    pub body: &'static str,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

static DOCUMENT_CELL: OnceLock<ContentProtocolsDocument> = OnceLock::new();

/// The document and its ETag never change for the process lifetime;
/// `last_modified` is pinned to first access since the binary carries no
/// build-time mtime for the embedded file.
pub fn document() -> &'static ContentProtocolsDocument {
    DOCUMENT_CELL.get_or_init(|| {
        let etag = etag_for(DOCUMENT.as_bytes());
        ContentProtocolsDocument { body: DOCUMENT, etag, last_modified: Utc::now() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_across_calls() {
        assert_eq!(document().etag, document().etag);
    }

    #[test]
    fn document_is_valid_json() {
        let parsed: serde_json::Value = serde_json::from_str(document().body).unwrap();
        assert!(parsed.is_object());
    }
}
