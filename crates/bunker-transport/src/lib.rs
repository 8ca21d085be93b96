//! Relay transport abstraction.
//!
//! The bunker talks to the world through the [`Transport`] trait: an
//! encrypted, authenticated request/response channel keyed by recipient
//! public key. The sender pubkey of every delivered [`Envelope`]
//! authenticates the caller; payloads cross the trait boundary as plaintext
//! — implementations own the encryption.
//!
//! Two implementations ship here: [`MemoryTransport`] (in-process hub for
//! tests and embedding) and [`RelayPool`] (websocket relays).

pub mod memory;
pub mod relay;

pub use memory::MemoryTransport;
pub use relay::RelayPool;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bunker_core::event::SignedEvent;
use bunker_core::identity::{Identity, PublicKey};

/// A decrypted inbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Authenticated sender.
    pub sender: PublicKey,
    /// Event kind the message arrived on (admin vs user plane).
    pub kind: u32,
    /// Decrypted payload (RPC JSON).
    pub payload: String,
}

/// Errors from transport implementations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("send failed: {reason}")]
    Send { reason: String },

    #[error("transport is closed")]
    Closed,
}

/// The relay channel contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to messages addressed to `recipient` on the given event
    /// kind. The identity is needed to decrypt inbound payloads.
    async fn subscribe(
        &self,
        recipient: &Identity,
        kind: u32,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError>;

    /// Send an encrypted payload from `from` to `to` on the given kind.
    async fn send(
        &self,
        from: &Identity,
        to: &PublicKey,
        kind: u32,
        payload: &str,
    ) -> Result<(), TransportError>;

    /// Publish a pre-signed public event (profiles, relay lists).
    async fn publish(&self, event: SignedEvent) -> Result<(), TransportError>;
}
