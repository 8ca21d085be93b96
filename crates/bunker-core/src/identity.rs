//! Signing identities and pairwise payload encryption.
//!
//! An [`Identity`] wraps a 32-byte seed and derives two keypairs from it:
//! an X25519 exchange keypair (the scalar is the clamped hash of the seed,
//! RFC 7748 style) and an Ed25519 signing keypair (directly from the seed).
//! The X25519 public key is the wire identity — it addresses transport
//! envelopes and keys the ACL. Pairwise payload encryption is static-static
//! X25519 Diffie-Hellman hashed to a symmetric key, sealed with AES-256-GCM;
//! a transported payload authenticates its sender because only the two
//! parties can produce a ciphertext that opens under their shared key.
//!
//! Event signatures are Ed25519 over the event digest and verify against the
//! author's signing public key ([`Identity::signing_public_key`]), which the
//! surrounding protocol publishes alongside the identity.
//!
//! Secret material is zeroized on drop and never appears in `Debug` output.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::error::{CryptoError, IdentityError};
use crate::event::{EventTemplate, SignedEvent};

/// Nonce length for AES-256-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// A 32-byte public key, hex-encoded on the wire and in storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidPublicKey {
            reason: "not hex".to_owned(),
        })?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPublicKey {
                reason: "must be 32 bytes".to_owned(),
            })?;
        Ok(Self(bytes))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse secret key material into raw seed bytes.
///
/// Accepts 64-character hex. This is the syntactic-validity check the keyring
/// runs after decrypting an envelope.
///
/// # Errors
///
/// Returns [`IdentityError::InvalidSecretKey`] for anything that is not
/// exactly 32 hex-decoded bytes.
pub fn parse_secret_key(material: &str) -> Result<Zeroizing<[u8; 32]>, IdentityError> {
    let trimmed = material.trim();
    let bytes = hex::decode(trimmed).map_err(|_| IdentityError::InvalidSecretKey {
        reason: "not hex".to_owned(),
    })?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidSecretKey {
            reason: "must be 32 bytes".to_owned(),
        })?;
    Ok(Zeroizing::new(bytes))
}

/// Derive the X25519 exchange scalar from the identity seed: hash the seed,
/// then clamp per RFC 7748.
fn exchange_secret_from_seed(seed: &[u8; 32]) -> StaticSecret {
    let digest = Sha256::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    StaticSecret::from(scalar)
}

/// An identity: the two keypairs derived from one 32-byte seed.
#[derive(Clone)]
pub struct Identity {
    seed: Zeroizing<[u8; 32]>,
    signing: SigningKey,
    exchange: StaticSecret,
    public: PublicKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Generate a fresh identity from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_secret_bytes(&seed)
    }

    /// Build an identity from raw seed bytes.
    #[must_use]
    pub fn from_secret_bytes(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let exchange = exchange_secret_from_seed(seed);
        let public = PublicKey(x25519_dalek::PublicKey::from(&exchange).to_bytes());
        Self {
            seed: Zeroizing::new(*seed),
            signing,
            exchange,
            public,
        }
    }

    /// Build an identity from hex secret key material.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidSecretKey`] if the material does not
    /// parse.
    pub fn from_secret_hex(material: &str) -> Result<Self, IdentityError> {
        let seed = parse_secret_key(material)?;
        Ok(Self::from_secret_bytes(&seed))
    }

    /// The wire identity: the X25519 exchange public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// The Ed25519 verifying key event signatures check against.
    #[must_use]
    pub fn signing_public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Hex encoding of the seed, for persisting raw (unencrypted) entries.
    /// Never log the result.
    #[must_use]
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(*self.seed))
    }

    /// Sign an event template, filling in the author identity and computing
    /// the event id.
    #[must_use]
    pub fn sign_event(&self, template: EventTemplate) -> SignedEvent {
        let id = crate::event::event_id(
            &self.public,
            template.created_at,
            template.kind,
            &template.tags,
            &template.content,
        );
        let sig = self.signing.sign(id.as_bytes());
        SignedEvent {
            id,
            pubkey: self.public,
            created_at: template.created_at,
            kind: template.kind,
            tags: template.tags,
            content: template.content,
            sig: hex::encode(sig.to_bytes()),
        }
    }

    /// Encrypt a payload for `to`. Output is `hex(nonce || ciphertext)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if the AEAD fails.
    pub fn conceal(&self, to: &PublicKey, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.shared_key(to);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption {
                reason: e.to_string(),
            })?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypt a payload produced by [`Identity::conceal`] on the other side.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] on authentication failure and
    /// [`CryptoError::InvalidHex`] if the payload is not hex.
    pub fn reveal(&self, from: &PublicKey, payload: &str) -> Result<String, CryptoError> {
        let combined =
            hex::decode(payload).map_err(|_| CryptoError::InvalidHex { field: "payload" })?;
        if combined.len() < NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

        let key = self.shared_key(from);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    /// Derive the pairwise symmetric key with `other`: static-static X25519
    /// Diffie-Hellman, hashed to 32 bytes. Both parties derive the same key.
    fn shared_key(&self, other: &PublicKey) -> Zeroizing<[u8; 32]> {
        let their_public = x25519_dalek::PublicKey::from(*other.as_bytes());
        let shared = self.exchange.diffie_hellman(&their_public);
        let digest = Sha256::digest(shared.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        key
    }
}

/// Verify an event against its claimed author identity and the author's
/// signing public key.
#[must_use]
pub fn verify_event(event: &SignedEvent, signer: &PublicKey) -> bool {
    let expected_id = crate::event::event_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    if expected_id != event.id {
        return false;
    }
    let Ok(vk) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(&event.sig) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
    vk.verify(event.id.as_bytes(), &sig).is_ok()
}
