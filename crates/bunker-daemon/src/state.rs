//! Shared daemon state.
//!
//! A single [`Bunker`] is constructed at startup and shared across the RPC
//! planes, the authorization engine, the web API, and the liveness monitor
//! via `Arc`. It is the mediator between the admin plane and the engine: the
//! engine fans approval requests out through it, and admin handlers resolve
//! them back through it, without either holding a reference to the other.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use bunker_core::config::{BunkerConfig, ConfigStore};
use bunker_core::identity::Identity;
use bunker_core::keys::Keyring;
use bunker_core::rpc::RpcFailure;
use bunker_store::Store;
use bunker_transport::Transport;

/// Timing knobs. Production uses the defaults; tests shrink them.
#[derive(Debug, Clone)]
pub struct Timings {
    /// How long the engine waits for an admin response.
    pub approval: Duration,
    /// Ledger poll interval for the web approval path.
    pub poll: Duration,
    /// Self-ping publish interval.
    pub ping_interval: Duration,
    /// Watchdog window: process exits after this much ping silence.
    pub watchdog: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            approval: Duration::from_secs(10),
            poll: Duration::from_millis(100),
            ping_interval: Duration::from_secs(20),
            watchdog: Duration::from_secs(50),
        }
    }
}

/// Receiver ends of the daemon's internal channels. Consumed by the user
/// plane and the liveness monitor.
pub struct BunkerChannels {
    /// Names of keys unlocked after boot.
    pub key_rx: mpsc::UnboundedReceiver<String>,
    /// One unit per observed self-ping.
    pub ping_rx: mpsc::UnboundedReceiver<()>,
}

/// Shared daemon state.
pub struct Bunker {
    /// Durable configuration; every read re-parses the file.
    pub config: ConfigStore,
    /// ACL, policies, tokens, and the request ledger.
    pub store: Store,
    /// Encrypted entries live in config; unlocked identities live here.
    pub keyring: Keyring,
    /// The relay channel.
    pub transport: std::sync::Arc<dyn Transport>,
    /// The bunker's own admin identity, cached at boot.
    pub admin: Identity,
    pub timings: Timings,
    /// Keys `--key` whitelisted for unlocking this run; empty means all.
    pub key_whitelist: Vec<String>,

    approvals: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
    key_tx: mpsc::UnboundedSender<String>,
    ping_tx: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for Bunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bunker")
            .field("admin", &self.admin.public_key())
            .finish_non_exhaustive()
    }
}

impl Bunker {
    /// Assemble the shared state. Returns the channel receivers for the user
    /// plane and liveness monitor.
    pub fn new(
        config: ConfigStore,
        store: Store,
        transport: std::sync::Arc<dyn Transport>,
        admin: Identity,
        timings: Timings,
        key_whitelist: Vec<String>,
    ) -> (std::sync::Arc<Self>, BunkerChannels) {
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let bunker = std::sync::Arc::new(Self {
            config,
            store,
            keyring: Keyring::new(),
            transport,
            admin,
            timings,
            key_whitelist,
            approvals: Mutex::new(HashMap::new()),
            key_tx,
            ping_tx,
        });
        (bunker, BunkerChannels { key_rx, ping_rx })
    }

    /// Load the configuration document, mapping failures to `Internal`.
    ///
    /// # Errors
    ///
    /// Returns an `Internal` failure when the file is unreadable.
    pub async fn load_config(&self) -> Result<BunkerConfig, RpcFailure> {
        self.config
            .load()
            .await
            .map_err(|e| RpcFailure::internal(e.to_string()))
    }

    /// Read-modify-write the configuration. A failed write is unrecoverable:
    /// the process exits non-zero.
    pub async fn persist_config<F>(&self, mutate: F) -> BunkerConfig
    where
        F: FnOnce(&mut BunkerConfig),
    {
        match self.config.update(mutate).await {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "configuration write failed; exiting");
                std::process::exit(1);
            }
        }
    }

    /// Register a pending approval handle keyed by ledger row id.
    pub fn register_approval(&self, ledger_id: &str) -> oneshot::Receiver<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.approvals
            .lock()
            .expect("approvals lock poisoned")
            .insert(ledger_id.to_owned(), tx);
        rx
    }

    /// Resolve a pending approval. The first response wins; later responses
    /// find nothing and return `false`.
    pub fn resolve_approval(&self, ledger_id: &str, value: serde_json::Value) -> bool {
        let sender = self
            .approvals
            .lock()
            .expect("approvals lock poisoned")
            .remove(ledger_id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a pending approval (timeout path).
    pub fn forget_approval(&self, ledger_id: &str) {
        self.approvals
            .lock()
            .expect("approvals lock poisoned")
            .remove(ledger_id);
    }

    /// Announce a freshly unlocked key so the user plane subscribes to it.
    pub fn notify_key_unlocked(&self, name: &str) {
        let _ = self.key_tx.send(name.to_owned());
    }

    /// Record an observed self-ping for the liveness watchdog.
    pub fn observe_self_ping(&self) {
        let _ = self.ping_tx.send(());
    }

    /// Whether this run may unlock the named key.
    #[must_use]
    pub fn key_allowed(&self, name: &str) -> bool {
        self.key_whitelist.is_empty() || self.key_whitelist.iter().any(|k| k == name)
    }
}
