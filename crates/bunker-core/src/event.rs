//! Event types for the wire protocol.
//!
//! The bunker never interprets event contents beyond what the ACL needs (the
//! kind for `sign_event` scoping). Encoding follows the protocol's canonical
//! serialization: the event id is the SHA-256 of
//! `[0, pubkey, created_at, kind, tags, content]`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::PublicKey;

/// Event kind for user-plane RPC envelopes.
pub const USER_RPC_KIND: u32 = 24133;

/// Event kind for admin-plane RPC envelopes. Distinct from the user plane so
/// the two channels never cross.
pub const ADMIN_RPC_KIND: u32 = 24134;

/// Event kind for encrypted direct messages (boot notifications).
pub const DIRECT_MESSAGE_KIND: u32 = 4;

/// Event kind for profile metadata.
pub const PROFILE_KIND: u32 = 0;

/// Event kind for follow lists.
pub const CONTACTS_KIND: u32 = 3;

/// Event kind for relay lists.
pub const RELAY_LIST_KIND: u32 = 10002;

/// An unsigned event as submitted to `sign_event`.
///
/// Clients typically omit `pubkey` (the bunker fills in the key being signed
/// with) and may omit `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "now_ts")]
    pub created_at: i64,
}

impl EventTemplate {
    /// A bare event of the given kind and content, stamped with the current
    /// time.
    #[must_use]
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: now_ts(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags = tags;
        self
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A signed event ready for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: PublicKey,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Compute the canonical event id.
#[must_use]
pub fn event_id(
    pubkey: &PublicKey,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    let canonical = serde_json::json!([0, pubkey.to_hex(), created_at, kind, tags, content]);
    // Serialization of a Value cannot fail.
    let serialized = canonical.to_string();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_with_missing_fields() {
        let template: EventTemplate =
            serde_json::from_str(r#"{"kind": 1, "content": "hi"}"#).unwrap();
        assert_eq!(template.kind, 1);
        assert_eq!(template.content, "hi");
        assert!(template.tags.is_empty());
        assert!(template.created_at > 0);
    }

    #[test]
    fn event_id_is_deterministic() {
        let pubkey = PublicKey::from_bytes([3u8; 32]);
        let a = event_id(&pubkey, 100, 1, &[], "x");
        let b = event_id(&pubkey, 100, 1, &[], "x");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn event_id_varies_with_content() {
        let pubkey = PublicKey::from_bytes([3u8; 32]);
        let a = event_id(&pubkey, 100, 1, &[], "x");
        let b = event_id(&pubkey, 100, 1, &[], "y");
        assert_ne!(a, b);
    }
}
