//! The user RPC plane.
//!
//! One subscription per unlocked key, each on the channel addressed to that
//! key's pubkey. Every inbound request passes through the authorization
//! engine before the underlying operation runs. Processing is serial per
//! request; distinct requests interleave freely.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use bunker_core::event::{EventTemplate, USER_RPC_KIND};
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::rpc::{Method, RpcFailure, RpcRequest, RpcResponse};
use bunker_transport::Envelope;
use tokio::sync::mpsc;

use crate::account;
use crate::authorize::{self, require_approved, store_failure, RequestContext};
use crate::state::Bunker;

/// Run the user plane: subscribe for every key unlocked at boot and for each
/// key announced on `key_rx` afterwards.
pub async fn run(bunker: Arc<Bunker>, mut key_rx: mpsc::UnboundedReceiver<String>) {
    let listening: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    for name in bunker.keyring.unlocked_names().await {
        spawn_key_listener(&bunker, &listening, &name).await;
    }
    while let Some(name) = key_rx.recv().await {
        spawn_key_listener(&bunker, &listening, &name).await;
    }
}

async fn spawn_key_listener(
    bunker: &Arc<Bunker>,
    listening: &Arc<Mutex<HashSet<String>>>,
    name: &str,
) {
    {
        let mut set = listening.lock().expect("listener set poisoned");
        if !set.insert(name.to_owned()) {
            return;
        }
    }
    let Some(identity) = bunker.keyring.get(name).await else {
        warn!(key = %name, "announced key is not unlocked; skipping");
        return;
    };

    let rx = match bunker.transport.subscribe(&identity, USER_RPC_KIND).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(key = %name, error = %e, "user-plane subscription failed");
            return;
        }
    };
    info!(key = %name, pubkey = %identity.public_key(), "user plane listening");

    let bunker = Arc::clone(bunker);
    let name = name.to_owned();
    tokio::spawn(async move {
        let mut rx = rx;
        while let Some(envelope) = rx.recv().await {
            let bunker = Arc::clone(&bunker);
            let name = name.clone();
            let identity = Arc::clone(&identity);
            tokio::spawn(async move {
                handle_envelope(&bunker, &name, &identity, envelope).await;
            });
        }
        warn!(key = %name, "user-plane subscription closed");
    });
}

async fn handle_envelope(
    bunker: &Arc<Bunker>,
    key_name: &str,
    identity: &Arc<Identity>,
    envelope: Envelope,
) {
    let Ok(request) = serde_json::from_str::<RpcRequest>(&envelope.payload) else {
        debug!(key = %key_name, sender = %envelope.sender, "discarding malformed user request");
        return;
    };

    let response = match dispatch(bunker, key_name, identity, &envelope.sender, &request).await {
        Ok(result) => RpcResponse::ok(&request.id, result),
        Err(failure) => {
            debug!(key = %key_name, sender = %envelope.sender, method = %request.method, error = %failure, "user request failed");
            RpcResponse::err(&request.id, &failure)
        }
    };

    let Ok(payload) = serde_json::to_string(&response) else {
        return;
    };
    if let Err(e) = bunker
        .transport
        .send(identity, &envelope.sender, USER_RPC_KIND, &payload)
        .await
    {
        warn!(key = %key_name, to = %envelope.sender, error = %e, "user response send failed");
    }
}

async fn dispatch(
    bunker: &Arc<Bunker>,
    key_name: &str,
    identity: &Arc<Identity>,
    sender: &PublicKey,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let method: Method = request.method.parse()?;

    let ctx = RequestContext {
        // Account creation has no key yet; its approval is one-shot and its
        // grants land on the freshly created key.
        key_name: (method != Method::CreateAccount).then_some(key_name),
        responder: identity,
        plane_kind: USER_RPC_KIND,
        remote: *sender,
        rpc_id: &request.id,
    };

    match method {
        Method::Connect => connect(bunker, &ctx, request).await,
        Method::SignEvent => sign_event(bunker, &ctx, identity, request).await,
        Method::Encrypt => encrypt(bunker, &ctx, identity, request).await,
        Method::Decrypt => decrypt(bunker, &ctx, identity, request).await,
        Method::Ping => {
            let permit = authorize::permit(bunker, &ctx, method, None, "ping").await?;
            require_approved(permit)?;
            Ok("pong".to_owned())
        }
        Method::CreateAccount => account::handle_create_account(bunker, &ctx, request).await,
        Method::Wildcard => Err(RpcFailure::bad_request("unknown method: *")),
    }
}

/// `connect(target?, token?)`: an optional second param redeems a one-shot
/// token before the permit check, so redemption installs the very rows the
/// lookup then finds.
async fn connect(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    if let Some(token) = request.param(1) {
        bunker
            .store
            .apply_token(&ctx.remote, token)
            .await
            .map_err(store_failure)?;
        info!(key = ?ctx.key_name, user = %ctx.remote, "token redeemed on connect");
    }

    let permit =
        authorize::permit(bunker, ctx, Method::Connect, None, "connect").await?;
    require_approved(permit)?;
    Ok("ack".to_owned())
}

async fn sign_event(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    identity: &Arc<Identity>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let raw = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("event required"))?;
    let template: EventTemplate = serde_json::from_str(raw)
        .map_err(|e| RpcFailure::bad_request(format!("bad event: {e}")))?;

    // Params are always serialized as the full event JSON for sign_event.
    let serialized = serde_json::to_string(&template)
        .map_err(|e| RpcFailure::internal(e.to_string()))?;
    let permit = authorize::permit(
        bunker,
        ctx,
        Method::SignEvent,
        Some(template.kind),
        &serialized,
    )
    .await?;
    require_approved(permit)?;

    let signed = identity.sign_event(template);
    serde_json::to_string(&signed).map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn encrypt(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    identity: &Arc<Identity>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let recipient: PublicKey = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("recipient required"))?
        .parse()
        .map_err(|_| RpcFailure::bad_request("bad recipient pubkey"))?;
    let plaintext = request.params.get(1).map(String::as_str).unwrap_or_default();

    let permit = authorize::permit(
        bunker,
        ctx,
        Method::Encrypt,
        None,
        &format!("encrypt to {recipient}"),
    )
    .await?;
    require_approved(permit)?;

    identity
        .conceal(&recipient, plaintext)
        .map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn decrypt(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    identity: &Arc<Identity>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let counterparty: PublicKey = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("sender pubkey required"))?
        .parse()
        .map_err(|_| RpcFailure::bad_request("bad sender pubkey"))?;
    let ciphertext = request
        .param(1)
        .ok_or_else(|| RpcFailure::bad_request("ciphertext required"))?;

    let permit = authorize::permit(
        bunker,
        ctx,
        Method::Decrypt,
        None,
        &format!("decrypt from {counterparty}"),
    )
    .await?;
    require_approved(permit)?;

    identity
        .reveal(&counterparty, ciphertext)
        .map_err(|e| RpcFailure::bad_request(e.to_string()))
}
