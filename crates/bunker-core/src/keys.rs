//! The keyring: encrypted key entries and the in-memory unlocked table.
//!
//! Stored entries live in the config document. Unlocked identities live only
//! in this process — plaintext key material never touches disk for entries
//! that carry a passphrase envelope. The unlocked table is mutated by the
//! admin handlers (`unlock_key`, `create_new_key`, `create_account`) and is
//! read-only from the user plane's perspective.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::crypto::{self, KeyEnvelope};
use crate::error::KeyringError;
use crate::identity::{Identity, PublicKey};

/// A stored key entry as persisted in the config document.
///
/// Exactly one of `envelope` / `raw` is set: passphrase-protected entries
/// carry an envelope, account-provisioned entries carry the raw hex key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKey {
    pub pubkey: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<KeyEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl StoredKey {
    /// Build an encrypted entry from an identity and passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::Crypto`] if envelope encryption fails.
    pub fn encrypted(identity: &Identity, passphrase: &str) -> Result<Self, KeyringError> {
        let secret = identity.secret_hex();
        let envelope = crypto::encrypt(secret.as_bytes(), passphrase)?;
        Ok(Self {
            pubkey: identity.public_key(),
            envelope: Some(envelope),
            raw: None,
        })
    }

    /// Build a raw (unencrypted) entry. Used by account provisioning where
    /// no operator passphrase exists.
    #[must_use]
    pub fn raw(identity: &Identity) -> Self {
        Self {
            pubkey: identity.public_key(),
            envelope: None,
            raw: Some(identity.secret_hex().to_string()),
        }
    }

    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.envelope.is_some()
    }
}

/// The in-memory unlocked-key table.
#[derive(Debug, Default)]
pub struct Keyring {
    unlocked: RwLock<HashMap<String, Arc<Identity>>>,
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Unlock a stored entry and install it.
    ///
    /// Decrypts the envelope (or reads the raw field), verifies the material
    /// parses as a secret key and matches the stored pubkey, then installs
    /// the identity. Failure leaves the table untouched.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::UnlockFailed`] on a bad passphrase, corrupt
    /// envelope, or material that is not a valid secret key.
    pub async fn unlock(
        &self,
        name: &str,
        stored: &StoredKey,
        passphrase: &str,
    ) -> Result<Arc<Identity>, KeyringError> {
        let identity = match (&stored.envelope, &stored.raw) {
            (Some(envelope), _) => {
                let plaintext =
                    crypto::decrypt(envelope, passphrase).map_err(|e| {
                        KeyringError::UnlockFailed {
                            name: name.to_owned(),
                            reason: e.to_string(),
                        }
                    })?;
                let material = String::from_utf8(plaintext).map_err(|_| {
                    KeyringError::UnlockFailed {
                        name: name.to_owned(),
                        reason: "decrypted material is not text".to_owned(),
                    }
                })?;
                Identity::from_secret_hex(&material).map_err(|e| KeyringError::UnlockFailed {
                    name: name.to_owned(),
                    reason: e.to_string(),
                })?
            }
            (None, Some(raw)) => {
                Identity::from_secret_hex(raw).map_err(|e| KeyringError::UnlockFailed {
                    name: name.to_owned(),
                    reason: e.to_string(),
                })?
            }
            (None, None) => {
                return Err(KeyringError::UnlockFailed {
                    name: name.to_owned(),
                    reason: "entry has neither envelope nor raw material".to_owned(),
                })
            }
        };

        if identity.public_key() != stored.pubkey {
            warn!(key = %name, "unlocked material does not match stored pubkey");
            return Err(KeyringError::UnlockFailed {
                name: name.to_owned(),
                reason: "material does not match stored pubkey".to_owned(),
            });
        }

        let identity = Arc::new(identity);
        self.install(name, Arc::clone(&identity)).await;
        Ok(identity)
    }

    /// Install an already-unlocked identity under a logical name.
    pub async fn install(&self, name: &str, identity: Arc<Identity>) {
        let mut table = self.unlocked.write().await;
        table.insert(name.to_owned(), identity);
        info!(key = %name, "key unlocked");
    }

    /// Fetch an unlocked identity by name.
    pub async fn get(&self, name: &str) -> Option<Arc<Identity>> {
        self.unlocked.read().await.get(name).cloned()
    }

    /// Whether the named key is currently unlocked.
    pub async fn is_unlocked(&self, name: &str) -> bool {
        self.unlocked.read().await.contains_key(name)
    }

    /// Names of all currently unlocked keys.
    pub async fn unlocked_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.unlocked.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlock_encrypted_entry() {
        let identity = Identity::generate();
        let stored = StoredKey::encrypted(&identity, "passphrase").unwrap();
        let keyring = Keyring::new();

        let unlocked = keyring.unlock("alice", &stored, "passphrase").await.unwrap();
        assert_eq!(unlocked.public_key(), identity.public_key());
        assert!(keyring.is_unlocked("alice").await);
    }

    #[tokio::test]
    async fn wrong_passphrase_leaves_table_untouched() {
        let identity = Identity::generate();
        let stored = StoredKey::encrypted(&identity, "passphrase").unwrap();
        let keyring = Keyring::new();

        let result = keyring.unlock("alice", &stored, "wrong").await;
        assert!(matches!(result, Err(KeyringError::UnlockFailed { .. })));
        assert!(!keyring.is_unlocked("alice").await);
    }

    #[tokio::test]
    async fn unlock_raw_entry_needs_no_passphrase() {
        let identity = Identity::generate();
        let stored = StoredKey::raw(&identity);
        let keyring = Keyring::new();

        let unlocked = keyring.unlock("bob", &stored, "").await.unwrap();
        assert_eq!(unlocked.public_key(), identity.public_key());
    }

    #[tokio::test]
    async fn mismatched_pubkey_is_rejected() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let mut stored = StoredKey::encrypted(&identity, "pass").unwrap();
        stored.pubkey = other.public_key();
        let keyring = Keyring::new();

        let result = keyring.unlock("alice", &stored, "pass").await;
        assert!(result.is_err());
        assert!(!keyring.is_unlocked("alice").await);
    }

    #[tokio::test]
    async fn unlocked_names_are_sorted() {
        let keyring = Keyring::new();
        keyring.install("zoe", Arc::new(Identity::generate())).await;
        keyring.install("abe", Arc::new(Identity::generate())).await;
        assert_eq!(keyring.unlocked_names().await, vec!["abe", "zoe"]);
    }
}
