//! Per-domain identity files.
//!
//! A JSON document `{names, relays, nip46}` mapping usernames to pubkeys,
//! rewritten atomically on every account creation.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The identity document for one domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFile {
    /// username → pubkey.
    #[serde(default)]
    pub names: BTreeMap<String, String>,
    /// Optional per-user relay hints.
    #[serde(default)]
    pub relays: BTreeMap<String, Vec<String>>,
    /// pubkey → relays the signer listens on.
    #[serde(default)]
    pub nip46: BTreeMap<String, Vec<String>>,
}

impl IdentityFile {
    /// Load the document; an absent file is an empty document.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or malformed files.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Write the document atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the write or rename fails.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn absent_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let doc = IdentityFile::load(&dir.path().join("nostr.json")).await.unwrap();
        assert!(doc.names.is_empty());
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nostr.json");

        let mut doc = IdentityFile::default();
        doc.names.insert("alice".to_owned(), "ab".repeat(32));
        doc.nip46
            .insert("ab".repeat(32), vec!["wss://relay.example".to_owned()]);
        doc.save(&path).await.unwrap();

        let loaded = IdentityFile::load(&path).await.unwrap();
        assert_eq!(loaded.names.get("alice"), Some(&"ab".repeat(32)));
        assert_eq!(loaded.nip46.len(), 1);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nostr.json");
        IdentityFile::default().save(&path).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
