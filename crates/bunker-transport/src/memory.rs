//! In-process transport hub.
//!
//! Routes envelopes between subscribers by `(recipient, kind)` without any
//! network or encryption — payloads are already plaintext on both edges of
//! the trait. Used by the integration tests and by embedders that run client
//! and bunker in one process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bunker_core::event::SignedEvent;
use bunker_core::identity::{Identity, PublicKey};

use crate::{Envelope, Transport, TransportError};

type SubKey = (PublicKey, u32);

/// An in-memory message hub implementing [`Transport`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    subscribers: Mutex<HashMap<SubKey, Vec<mpsc::UnboundedSender<Envelope>>>>,
    published: Mutex<Vec<SignedEvent>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published via [`Transport::publish`], for test inspection.
    #[must_use]
    pub fn published(&self) -> Vec<SignedEvent> {
        self.published
            .lock()
            .expect("published lock poisoned")
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        recipient: &Identity,
        kind: u32,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        subs.entry((recipient.public_key(), kind))
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn send(
        &self,
        from: &Identity,
        to: &PublicKey,
        kind: u32,
        payload: &str,
    ) -> Result<(), TransportError> {
        let envelope = Envelope {
            sender: from.public_key(),
            kind,
            payload: payload.to_owned(),
        };
        let mut subs = self.subscribers.lock().expect("subscribers lock poisoned");
        if let Some(senders) = subs.get_mut(&(*to, kind)) {
            senders.retain(|tx| tx.send(envelope.clone()).is_ok());
        }
        // No subscriber is not an error: relays also accept messages nobody
        // is currently reading.
        Ok(())
    }

    async fn publish(&self, event: SignedEvent) -> Result<(), TransportError> {
        self.published
            .lock()
            .expect("published lock poisoned")
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bunker_core::event::EventTemplate;

    #[tokio::test]
    async fn routed_by_recipient_and_kind() {
        let hub = MemoryTransport::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let mut rx = hub.subscribe(&bob, 24133).await.unwrap();
        hub.send(&alice, &bob.public_key(), 24133, "hello").await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sender, alice.public_key());
        assert_eq!(envelope.payload, "hello");
    }

    #[tokio::test]
    async fn wrong_kind_is_not_delivered() {
        let hub = MemoryTransport::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let mut rx = hub.subscribe(&bob, 24133).await.unwrap();
        hub.send(&alice, &bob.public_key(), 24134, "admin stuff")
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_addressed_messages_loop_back() {
        let hub = MemoryTransport::new();
        let me = Identity::generate();

        let mut rx = hub.subscribe(&me, 24134).await.unwrap();
        hub.send(&me, &me.public_key(), 24134, "ping").await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sender, me.public_key());
    }

    #[tokio::test]
    async fn published_events_are_recorded() {
        let hub = MemoryTransport::new();
        let me = Identity::generate();
        let event = me.sign_event(EventTemplate::new(0, "{}"));
        hub.publish(event).await.unwrap();
        assert_eq!(hub.published().len(), 1);
    }
}
