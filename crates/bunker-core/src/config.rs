//! The durable configuration document and its file store.
//!
//! A single JSON file (default `config/nsecbunker.json`) holds the admin
//! identities, relay lists, encrypted key entries, and domain records. Writes
//! are atomic (temp file + rename) and stamp a monotonically increasing
//! `schemaVersion`. There is no in-memory cache beyond the boot-time admin
//! identity: every read re-parses the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::ConfigError;
use crate::identity::{Identity, PublicKey};
use crate::keys::StoredKey;

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/nsecbunker.json";

/// The configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BunkerConfig {
    /// Bumped on every write.
    pub schema_version: u64,
    /// Pubkeys allowed on the admin plane.
    pub admins: Vec<PublicKey>,
    /// Relays the admin plane subscribes on.
    pub admin_relays: Vec<String>,
    /// Relays the user plane subscribes on.
    pub user_relays: Vec<String>,
    /// Relays skeleton profiles are published to.
    pub seed_relays: Vec<String>,
    /// Hex secret key of the bunker's own admin identity.
    pub bunker_secret: String,
    /// Stored key entries by logical name.
    pub keys: BTreeMap<String, StoredKey>,
    /// Domain records for account provisioning.
    pub domains: BTreeMap<String, DomainConfig>,
    /// Public base URL for the web approval flow. When set, unknown requests
    /// return an `auth_url` instead of fanning out to admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Listen address for the approval web API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    /// Admit `create_account` from unknown senders.
    pub allow_new_keys: bool,
    /// DM the connection string to every admin on boot.
    pub notify_admins_on_boot: bool,
}

impl Default for BunkerConfig {
    fn default() -> Self {
        Self {
            schema_version: 0,
            admins: Vec::new(),
            admin_relays: Vec::new(),
            user_relays: Vec::new(),
            seed_relays: Vec::new(),
            bunker_secret: String::new(),
            keys: BTreeMap::new(),
            domains: BTreeMap::new(),
            base_url: None,
            listen_addr: None,
            allow_new_keys: false,
            notify_admins_on_boot: false,
        }
    }
}

/// Per-domain account provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// Path of the identity file this domain's account mappings land in.
    pub identity_file: PathBuf,
    /// Profile template applied to newly created accounts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<serde_json::Value>,
    /// Wallet backend, when lightning provisioning is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletConfig>,
}

/// Wallet backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl BunkerConfig {
    /// The bunker's own admin identity, parsed from the stored secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`]-equivalent failure if the stored secret
    /// is malformed; a default document always carries a valid one.
    pub fn admin_identity(&self) -> Result<Identity, crate::error::IdentityError> {
        Identity::from_secret_hex(&self.bunker_secret)
    }

    /// The `bunker://` connection string for this configuration.
    ///
    /// Relay URLs are url-encoded and stripped of their `wss://` prefix.
    #[must_use]
    pub fn connection_string(&self, admin_pubkey: &PublicKey) -> String {
        let relays: Vec<String> = self
            .admin_relays
            .iter()
            .map(|r| {
                let stripped = r.strip_prefix("wss://").unwrap_or(r);
                urlencoding::encode(stripped).into_owned()
            })
            .collect();
        format!("bunker://{}@{}", admin_pubkey.to_hex(), relays.join(","))
    }
}

/// File-backed config store. Writers serialize behind the internal mutex;
/// the whole file is rewritten on every change.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document. If the file is absent, write and return
    /// a default document containing a freshly generated bunker identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] / [`ConfigError::Parse`] on unreadable or
    /// malformed files.
    pub async fn load(&self) -> Result<BunkerConfig, ConfigError> {
        if let Some(config) = self.read().await? {
            return Ok(config);
        }

        let _guard = self.write_lock.lock().await;
        // A concurrent writer may have created the file meanwhile.
        if let Some(config) = self.read().await? {
            return Ok(config);
        }
        let mut config = default_config();
        self.save_locked(&mut config).await?;
        info!(path = %self.path.display(), "wrote default configuration");
        Ok(config)
    }

    /// Write the document atomically, bumping `schemaVersion` first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the temp-file write or rename fails.
    /// Callers in the daemon treat that as unrecoverable.
    pub async fn save(&self, config: &mut BunkerConfig) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().await;
        self.save_locked(config).await
    }

    /// Read-modify-write; the write lock is held across the whole cycle so
    /// concurrent writers cannot lose updates.
    ///
    /// # Errors
    ///
    /// Propagates load/save failures.
    pub async fn update<F>(&self, mutate: F) -> Result<BunkerConfig, ConfigError>
    where
        F: FnOnce(&mut BunkerConfig),
    {
        let _guard = self.write_lock.lock().await;
        let mut config = match self.read().await? {
            Some(config) => config,
            None => default_config(),
        };
        mutate(&mut config);
        self.save_locked(&mut config).await?;
        Ok(config)
    }

    /// Parse the file if it exists; `None` when absent.
    async fn read(&self) -> Result<Option<BunkerConfig>, ConfigError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ConfigError::Parse {
                    path: self.path.display().to_string(),
                    source: e,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io {
                path: self.path.display().to_string(),
                source: e,
            }),
        }
    }

    async fn save_locked(&self, config: &mut BunkerConfig) -> Result<(), ConfigError> {
        config.schema_version += 1;

        let bytes = serde_json::to_vec_pretty(config).map_err(ConfigError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConfigError::Io {
                        path: parent.display().to_string(),
                        source: e,
                    })?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ConfigError::Io {
                path: tmp.display().to_string(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ConfigError::Io {
                path: self.path.display().to_string(),
                source: e,
            })
    }
}

fn default_config() -> BunkerConfig {
    BunkerConfig {
        bunker_secret: Identity::generate().secret_hex().to_string(),
        ..BunkerConfig::default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nsecbunker.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn load_creates_default_with_fresh_key() {
        let (_dir, store) = temp_store();
        let config = store.load().await.unwrap();
        assert!(!config.bunker_secret.is_empty());
        assert!(config.admin_identity().is_ok());
        // The default was persisted.
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn save_bumps_schema_version() {
        let (_dir, store) = temp_store();
        let mut config = store.load().await.unwrap();
        let before = config.schema_version;
        store.save(&mut config).await.unwrap();
        assert_eq!(config.schema_version, before + 1);
    }

    #[tokio::test]
    async fn load_reparses_what_was_saved() {
        let (_dir, store) = temp_store();
        store
            .update(|c| c.admin_relays.push("wss://relay.example".to_owned()))
            .await
            .unwrap();
        let config = store.load().await.unwrap();
        assert_eq!(config.admin_relays, vec!["wss://relay.example"]);
    }

    #[tokio::test]
    async fn two_loads_return_same_identity() {
        let (_dir, store) = temp_store();
        let a = store.load().await.unwrap();
        let b = store.load().await.unwrap();
        assert_eq!(a.bunker_secret, b.bunker_secret);
    }

    #[test]
    fn connection_string_strips_and_encodes() {
        let config = BunkerConfig {
            admin_relays: vec![
                "wss://relay.one".to_owned(),
                "wss://relay.two/path".to_owned(),
            ],
            ..BunkerConfig::default()
        };
        let pubkey = PublicKey::from_bytes([0xab; 32]);
        let conn = config.connection_string(&pubkey);
        assert!(conn.starts_with(&format!("bunker://{}@", pubkey.to_hex())));
        assert!(conn.contains("relay.one"));
        assert!(!conn.contains("wss://"));
        // The slash in the second relay is percent-encoded.
        assert!(conn.contains("relay.two%2Fpath"));
    }
}
