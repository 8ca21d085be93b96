//! Websocket relay pool.
//!
//! A thin client over a set of relays: every outbound message is published to
//! all of them, every subscription is registered on all of them, and inbound
//! events are deduplicated only by the relays themselves. Connection loss is
//! logged, not repaired — the liveness monitor exits the process when the
//! admin channel goes quiet and the outer supervisor restarts it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use bunker_core::event::{event_id, EventTemplate, SignedEvent};
use bunker_core::identity::{Identity, PublicKey};

use crate::{Envelope, Transport, TransportError};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct Subscription {
    identity: Identity,
    kind: u32,
    tx: mpsc::UnboundedSender<Envelope>,
}

type SubscriptionMap = Arc<StdMutex<HashMap<String, Subscription>>>;

/// A pool of websocket relay connections implementing [`Transport`].
pub struct RelayPool {
    writers: Vec<Arc<Mutex<WsSink>>>,
    subscriptions: SubscriptionMap,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.writers.len())
            .finish_non_exhaustive()
    }
}

impl RelayPool {
    /// Connect to every relay in the list. Individual failures are logged;
    /// at least one connection must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] when no relay is reachable.
    pub async fn connect(urls: &[String]) -> Result<Self, TransportError> {
        let subscriptions: SubscriptionMap = Arc::new(StdMutex::new(HashMap::new()));
        let mut writers = Vec::new();
        let mut last_error = String::new();

        for url in urls {
            match connect_async(url).await {
                Ok((stream, _)) => {
                    let (sink, mut reader) = stream.split();
                    writers.push(Arc::new(Mutex::new(sink)));
                    info!(relay = %url, "relay connected");

                    let subs = Arc::clone(&subscriptions);
                    let relay = url.clone();
                    tokio::spawn(async move {
                        while let Some(message) = reader.next().await {
                            match message {
                                Ok(Message::Text(text)) => dispatch(&subs, &text),
                                Ok(_) => {}
                                Err(e) => {
                                    warn!(relay = %relay, error = %e, "relay read error");
                                    break;
                                }
                            }
                        }
                        warn!(relay = %relay, "relay disconnected");
                    });
                }
                Err(e) => {
                    warn!(relay = %url, error = %e, "relay connection failed");
                    last_error = e.to_string();
                }
            }
        }

        if writers.is_empty() {
            return Err(TransportError::Connect {
                url: urls.join(","),
                reason: last_error,
            });
        }
        Ok(Self {
            writers,
            subscriptions,
        })
    }

    async fn broadcast(&self, text: String) -> Result<(), TransportError> {
        let mut delivered = 0usize;
        for writer in &self.writers {
            let mut sink = writer.lock().await;
            match sink.send(Message::Text(text.clone())).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(error = %e, "relay write failed"),
            }
        }
        if delivered == 0 {
            return Err(TransportError::Send {
                reason: "no relay accepted the message".to_owned(),
            });
        }
        Ok(())
    }
}

/// Route one inbound relay frame to its subscription.
fn dispatch(subs: &SubscriptionMap, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let Some(items) = value.as_array() else {
        return;
    };
    if items.first().and_then(|v| v.as_str()) != Some("EVENT") {
        return;
    }
    let (Some(sub_id), Some(event_value)) =
        (items.get(1).and_then(|v| v.as_str()), items.get(2))
    else {
        return;
    };
    let Ok(event) = serde_json::from_value::<SignedEvent>(event_value.clone()) else {
        debug!("discarding malformed event");
        return;
    };
    // Integrity: the id must match the canonical digest. Sender authenticity
    // comes from the AEAD below — only the keyholder can produce a payload
    // that opens under the pairwise key.
    let expected_id = event_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    if expected_id != event.id {
        warn!(event = %event.id, "discarding event with mismatched id");
        return;
    }

    let subs = subs.lock().expect("subscription lock poisoned");
    let Some(subscription) = subs.get(sub_id) else {
        return;
    };
    if event.kind != subscription.kind {
        return;
    }
    match subscription.identity.reveal(&event.pubkey, &event.content) {
        Ok(payload) => {
            let _ = subscription.tx.send(Envelope {
                sender: event.pubkey,
                kind: event.kind,
                payload,
            });
        }
        Err(e) => debug!(event = %event.id, error = %e, "payload decryption failed"),
    }
}

#[async_trait]
impl Transport for RelayPool {
    async fn subscribe(
        &self,
        recipient: &Identity,
        kind: u32,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
            subs.insert(
                sub_id.clone(),
                Subscription {
                    identity: recipient.clone(),
                    kind,
                    tx,
                },
            );
        }

        let filter = serde_json::json!([
            "REQ",
            sub_id,
            { "kinds": [kind], "#p": [recipient.public_key().to_hex()] }
        ]);
        self.broadcast(filter.to_string()).await?;
        Ok(rx)
    }

    async fn send(
        &self,
        from: &Identity,
        to: &PublicKey,
        kind: u32,
        payload: &str,
    ) -> Result<(), TransportError> {
        let content = from.conceal(to, payload).map_err(|e| TransportError::Send {
            reason: e.to_string(),
        })?;
        let template = EventTemplate::new(kind, content)
            .with_tags(vec![vec!["p".to_owned(), to.to_hex()]]);
        let event = from.sign_event(template);
        self.publish(event).await
    }

    async fn publish(&self, event: SignedEvent) -> Result<(), TransportError> {
        let frame = serde_json::json!(["EVENT", event]);
        self.broadcast(frame.to_string()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_ignores_non_event_frames() {
        let subs: SubscriptionMap = Arc::new(StdMutex::new(HashMap::new()));
        dispatch(&subs, r#"["EOSE", "sub1"]"#);
        dispatch(&subs, "not json");
        dispatch(&subs, r#"{"object": true}"#);
        // Nothing panics, nothing is delivered.
    }

    #[tokio::test]
    async fn dispatch_delivers_to_matching_subscription() {
        let subs: SubscriptionMap = Arc::new(StdMutex::new(HashMap::new()));
        let bunker = Identity::generate();
        let client = Identity::generate();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subs.lock().unwrap().insert(
            "sub1".to_owned(),
            Subscription {
                identity: bunker.clone(),
                kind: 24133,
                tx,
            },
        );

        let content = client.conceal(&bunker.public_key(), "payload").unwrap();
        let event = client.sign_event(
            EventTemplate::new(24133, content)
                .with_tags(vec![vec!["p".to_owned(), bunker.public_key().to_hex()]]),
        );
        let frame = serde_json::json!(["EVENT", "sub1", event]).to_string();
        dispatch(&subs, &frame);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.sender, client.public_key());
        assert_eq!(envelope.payload, "payload");
    }

    #[tokio::test]
    async fn dispatch_drops_tampered_events() {
        let subs: SubscriptionMap = Arc::new(StdMutex::new(HashMap::new()));
        let bunker = Identity::generate();
        let client = Identity::generate();

        let (tx, mut rx) = mpsc::unbounded_channel();
        subs.lock().unwrap().insert(
            "sub1".to_owned(),
            Subscription {
                identity: bunker.clone(),
                kind: 24133,
                tx,
            },
        );

        // Tampering breaks the canonical id (and the AEAD, were it to get
        // that far).
        let content = client.conceal(&bunker.public_key(), "payload").unwrap();
        let mut event = client.sign_event(EventTemplate::new(24133, content));
        event.content = "tampered".to_owned();
        let frame = serde_json::json!(["EVENT", "sub1", event]).to_string();
        dispatch(&subs, &frame);

        assert!(rx.try_recv().is_err());
    }
}
