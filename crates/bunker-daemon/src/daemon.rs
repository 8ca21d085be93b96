//! Daemon bootstrap.
//!
//! Loads the configuration, opens the database, connects the relay pool,
//! assembles the shared [`Bunker`] state, and runs the planes until one of
//! them fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use bunker_core::config::ConfigStore;
use bunker_core::identity::PublicKey;
use bunker_store::Store;
use bunker_transport::{RelayPool, Transport};

use crate::state::{Bunker, Timings};
use crate::{admin, liveness, user, web};

/// Options for the `start` command.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub config_path: PathBuf,
    /// Keys allowed to be unlocked this run; empty means all.
    pub keys: Vec<String>,
    /// Admin pubkeys merged into the configuration (flags + environment).
    pub admins: Vec<PublicKey>,
}

/// Boot the bunker and run until a plane fails.
///
/// # Errors
///
/// Fatal boot failures: unreadable config, bad bunker secret, no reachable
/// relay, database failure.
pub async fn run(options: StartOptions) -> anyhow::Result<()> {
    let config_store = ConfigStore::new(&options.config_path);
    let mut config = config_store.load().await.context("config read failed")?;

    let missing: Vec<PublicKey> = options
        .admins
        .iter()
        .copied()
        .filter(|a| !config.admins.contains(a))
        .collect();
    if !missing.is_empty() {
        config = config_store
            .update(|c| c.admins.extend(missing))
            .await
            .context("config write failed")?;
    }

    let admin = config
        .admin_identity()
        .context("stored bunker secret is invalid")?;

    let db_path = options
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("nsecbunker.db"), |p| p.join("nsecbunker.db"));
    let store = Store::open(&db_path).await.context("database open failed")?;

    let mut relays: Vec<String> = config
        .admin_relays
        .iter()
        .chain(&config.user_relays)
        .chain(&config.seed_relays)
        .cloned()
        .collect();
    relays.sort();
    relays.dedup();
    anyhow::ensure!(!relays.is_empty(), "no relays configured; edit the config first");

    let transport: Arc<dyn Transport> =
        Arc::new(RelayPool::connect(&relays).await.context("relay connection failed")?);

    let (bunker, channels) = Bunker::new(
        config_store,
        store,
        transport,
        admin,
        Timings::default(),
        options.keys,
    );

    admin::announce(&bunker).await?;
    info!(keys = config.keys.len(), admins = config.admins.len(), "bunker starting");

    let admin_plane = tokio::spawn(admin::run(Arc::clone(&bunker)));
    let user_plane = tokio::spawn(user::run(Arc::clone(&bunker), channels.key_rx));
    let monitor = tokio::spawn(liveness::run(Arc::clone(&bunker), channels.ping_rx));

    let web_server = config.base_url.as_ref().map(|_| {
        let addr = config
            .listen_addr
            .as_deref()
            .unwrap_or("127.0.0.1:8080")
            .parse()
            .unwrap_or_else(|_| std::net::SocketAddr::from(([127, 0, 0, 1], 8080)));
        tokio::spawn(web::run(Arc::clone(&bunker), addr))
    });

    tokio::select! {
        result = admin_plane => anyhow::bail!("admin plane stopped: {result:?}"),
        result = user_plane => anyhow::bail!("user plane stopped: {result:?}"),
        result = monitor => anyhow::bail!("liveness monitor stopped: {result:?}"),
        result = async {
            match web_server {
                Some(handle) => handle.await,
                // No web server configured; park this branch forever.
                None => std::future::pending().await,
            }
        } => anyhow::bail!("web server stopped: {result:?}"),
    }
}
