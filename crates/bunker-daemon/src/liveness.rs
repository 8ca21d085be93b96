//! The liveness monitor.
//!
//! Publishes a self-addressed ping on the admin channel every ping interval;
//! the admin plane reports each observed self-ping back through the state.
//! If the watchdog window passes without one, the relay path is dead and the
//! process exits non-zero — crash-only recovery, an outer supervisor
//! restarts it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use bunker_core::event::ADMIN_RPC_KIND;
use bunker_core::rpc::RpcRequest;

use crate::state::Bunker;

/// Run the pinger and watchdog. Only returns on channel teardown; a watchdog
/// expiry exits the process.
///
/// # Errors
///
/// Returns an error when the ping channel closes (daemon shutdown).
pub async fn run(
    bunker: Arc<Bunker>,
    mut ping_rx: mpsc::UnboundedReceiver<()>,
) -> anyhow::Result<()> {
    let pinger = {
        let bunker = Arc::clone(&bunker);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bunker.timings.ping_interval);
            loop {
                ticker.tick().await;
                let ping = RpcRequest::new("ping", Vec::new());
                let Ok(payload) = serde_json::to_string(&ping) else {
                    continue;
                };
                let self_pubkey = bunker.admin.public_key();
                if let Err(e) = bunker
                    .transport
                    .send(&bunker.admin, &self_pubkey, ADMIN_RPC_KIND, &payload)
                    .await
                {
                    debug!(error = %e, "self-ping publish failed");
                }
            }
        })
    };

    let watchdog = bunker.timings.watchdog;
    loop {
        match tokio::time::timeout(watchdog, ping_rx.recv()).await {
            Ok(Some(())) => debug!("self-ping observed"),
            Ok(None) => {
                pinger.abort();
                anyhow::bail!("liveness channel closed");
            }
            Err(_) => {
                error!(window = ?watchdog, "no self-ping observed; exiting");
                std::process::exit(1);
            }
        }
    }
}
