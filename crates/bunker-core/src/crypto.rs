//! Passphrase envelope encryption for stored secret keys.
//!
//! Secret keys rest on disk inside a [`KeyEnvelope`]: AES-256-CBC with a key
//! derived from the operator's passphrase and a fresh random 128-bit IV per
//! encryption. All fields are hex-encoded for the JSON config document.
//!
//! Two envelope versions exist:
//!
//! - **v1** (legacy): key = SHA-256 of the passphrase bytes, unsalted. Still
//!   decryptable so old config entries keep working.
//! - **v2** (default for new entries): key = Argon2id(passphrase, salt) with
//!   a random 16-byte salt carried in the envelope.
//!
//! An envelope without a `version` field is treated as v1.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Envelope version written for new encryptions.
const CURRENT_VERSION: u8 = 2;

/// Argon2id parameters for v2 key derivation (64 MiB, t=3, p=1).
const ARGON2_MEMORY_KIB: u32 = 65_536;
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;

const IV_LEN: usize = 16;
const SALT_LEN: usize = 16;

/// An encrypted secret key at rest. All byte fields are hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyEnvelope {
    /// Envelope version. Absent in documents written before versioning — those
    /// are v1 (single unsalted digest KDF).
    #[serde(default = "default_version", skip_serializing_if = "is_v1")]
    pub version: u8,
    /// Argon2id salt, v2 only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// CBC initialization vector.
    pub iv: String,
    /// Ciphertext.
    pub data: String,
}

fn default_version() -> u8 {
    1
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_v1(version: &u8) -> bool {
    *version == 1
}

/// Encrypt `plaintext` under `passphrase`, producing a v2 envelope.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivation`] if Argon2id fails (parameter
/// misconfiguration; does not happen with the constants above).
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<KeyEnvelope, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let key = derive_key_v2(passphrase, &salt)?;

    let ciphertext =
        Aes256CbcEnc::new((&*key).into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(KeyEnvelope {
        version: CURRENT_VERSION,
        salt: Some(hex::encode(salt)),
        iv: hex::encode(iv),
        data: hex::encode(ciphertext),
    })
}

/// Decrypt an envelope with `passphrase`.
///
/// # Errors
///
/// - [`CryptoError::InvalidHex`] if a field does not hex-decode.
/// - [`CryptoError::UnsupportedVersion`] for versions this build predates.
/// - [`CryptoError::BadPassphraseOrCorrupt`] on any padding or decryption
///   failure — wrong passphrase and corrupted data are indistinguishable.
pub fn decrypt(envelope: &KeyEnvelope, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let iv = decode_exact::<IV_LEN>(&envelope.iv, "iv")?;
    let data = hex::decode(&envelope.data).map_err(|_| CryptoError::InvalidHex { field: "data" })?;

    let key = match envelope.version {
        1 => derive_key_v1(passphrase),
        2 => {
            let salt_hex = envelope.salt.as_deref().ok_or(CryptoError::InvalidHex { field: "salt" })?;
            let salt = decode_exact::<SALT_LEN>(salt_hex, "salt")?;
            derive_key_v2(passphrase, &salt)?
        }
        version => return Err(CryptoError::UnsupportedVersion { version }),
    };

    Aes256CbcDec::new((&*key).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|_| CryptoError::BadPassphraseOrCorrupt)
}

/// v1 KDF: a single unsalted SHA-256 of the passphrase bytes.
///
/// Kept only so envelopes written by older deployments still unlock.
fn derive_key_v1(passphrase: &str) -> Zeroizing<[u8; 32]> {
    let digest = Sha256::digest(passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&digest);
    key
}

/// v2 KDF: Argon2id with a per-envelope salt.
fn derive_key_v2(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation {
        reason: e.to_string(),
    })?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(key)
}

fn decode_exact<const N: usize>(hex_str: &str, field: &'static str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidHex { field })?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidHex { field })
}
