//! Error types for `bunker-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material or passphrases —
//! only key names or operation descriptions.

/// Errors from the passphrase envelope and pairwise encryption primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Decryption failed: wrong passphrase, corrupted ciphertext, or bad padding.
    ///
    /// CBC gives no way to tell these apart, so they collapse into one variant.
    #[error("bad passphrase or corrupt ciphertext")]
    BadPassphraseOrCorrupt,

    /// A hex-encoded field of the envelope did not decode.
    #[error("invalid hex in {field}")]
    InvalidHex { field: &'static str },

    /// The envelope carries a version this build does not understand.
    #[error("unsupported key envelope version {version}")]
    UnsupportedVersion { version: u8 },

    /// Argon2id key derivation failed.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// AEAD encryption of a pairwise payload failed.
    #[error("payload encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption of a pairwise payload failed (wrong key or tampered data).
    #[error("payload decryption failed")]
    Decryption,
}

/// Errors from identity and signature handling.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The supplied material does not parse as a 32-byte secret key.
    #[error("invalid secret key: {reason}")]
    InvalidSecretKey { reason: String },

    /// The supplied material does not parse as a public key.
    #[error("invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    /// A pairwise crypto operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the keyring (encrypted entries + unlocked table).
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    /// No stored entry under that logical name.
    #[error("unknown key: {name}")]
    UnknownKey { name: String },

    /// The key exists but has not been unlocked.
    #[error("key is locked: {name}")]
    Locked { name: String },

    /// The decrypted material is not a valid secret key, or the passphrase
    /// was wrong.
    #[error("unlock failed for {name}: {reason}")]
    UnlockFailed { name: String, reason: String },

    /// Envelope crypto failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the configuration store.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed.
    #[error("config io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file did not parse as a configuration document.
    #[error("config parse error at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The document could not be serialized (should not happen in practice).
    #[error("config serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
}
