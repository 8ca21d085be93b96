//! The admin RPC plane.
//!
//! Subscribes on the channel tagged with the bunker's own admin pubkey and
//! dispatches admin commands. Requests are admitted only from configured
//! admin pubkeys, with one exception: `create_account` is admissible from
//! any sender while `allowNewKeys` is set, so accounts can be opened before
//! any ACL exists.
//!
//! Inbound frames that look like responses (no `method` field) are routed to
//! the engine's pending approvals — that is how `acl` fanout answers come
//! back.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use bunker_core::event::{
    EventTemplate, ADMIN_RPC_KIND, CONTACTS_KIND, DIRECT_MESSAGE_KIND, PROFILE_KIND,
    RELAY_LIST_KIND,
};
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::keys::StoredKey;
use bunker_core::rpc::{RpcErrorKind, RpcFailure, RpcRequest, RpcResponse};
use bunker_store::policy::PolicySpec;
use bunker_transport::Envelope;
use sha2::{Digest, Sha256};

use crate::account;
use crate::authorize::{store_failure, RequestContext};
use crate::state::Bunker;

/// Run the admin plane until the transport closes.
///
/// # Errors
///
/// Returns an error if the initial subscription fails.
pub async fn run(bunker: Arc<Bunker>) -> anyhow::Result<()> {
    let mut rx = bunker
        .transport
        .subscribe(&bunker.admin, ADMIN_RPC_KIND)
        .await?;
    info!(pubkey = %bunker.admin.public_key(), "admin plane listening");

    while let Some(envelope) = rx.recv().await {
        let bunker = Arc::clone(&bunker);
        tokio::spawn(async move {
            handle_envelope(&bunker, envelope).await;
        });
    }
    anyhow::bail!("admin subscription closed")
}

async fn handle_envelope(bunker: &Arc<Bunker>, envelope: Envelope) {
    let Ok(value) = serde_json::from_str::<Value>(&envelope.payload) else {
        debug!(sender = %envelope.sender, "discarding non-JSON admin frame");
        return;
    };

    // Responses (acl fanout answers) have no method field.
    if value.get("method").is_none() {
        if let Ok(response) = serde_json::from_value::<RpcResponse>(value) {
            route_acl_response(bunker, &response);
        }
        return;
    }

    let Ok(request) = serde_json::from_str::<RpcRequest>(&envelope.payload) else {
        debug!(sender = %envelope.sender, "discarding malformed admin request");
        return;
    };

    // The liveness monitor's self-addressed ping: observe, don't answer.
    if request.method == "ping" && envelope.sender == bunker.admin.public_key() {
        bunker.observe_self_ping();
        return;
    }

    let response = match dispatch(bunker, &envelope.sender, &request).await {
        Ok(result) => RpcResponse::ok(&request.id, result),
        Err(failure) => {
            debug!(sender = %envelope.sender, method = %request.method, error = %failure, "admin command failed");
            RpcResponse::err(&request.id, &failure)
        }
    };
    respond(bunker, &envelope.sender, &response).await;
}

/// An inbound response frame settles the matching pending approval. The
/// `result` field carries the admin's decision, itself JSON-encoded.
fn route_acl_response(bunker: &Arc<Bunker>, response: &RpcResponse) {
    let Some(result) = response.result.as_deref() else {
        return;
    };
    let decision =
        serde_json::from_str::<Value>(result).unwrap_or_else(|_| Value::String(result.to_owned()));
    if bunker.resolve_approval(&response.id, decision) {
        info!(request = %response.id, "acl response accepted");
    }
}

async fn respond(bunker: &Arc<Bunker>, to: &PublicKey, response: &RpcResponse) {
    let Ok(payload) = serde_json::to_string(response) else {
        return;
    };
    if let Err(e) = bunker
        .transport
        .send(&bunker.admin, to, ADMIN_RPC_KIND, &payload)
        .await
    {
        warn!(to = %to, error = %e, "admin response send failed");
    }
}

async fn dispatch(
    bunker: &Arc<Bunker>,
    sender: &PublicKey,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let config = bunker.load_config().await?;
    let is_admin = config.admins.contains(sender);

    if !is_admin && !(request.method == "create_account" && config.allow_new_keys) {
        return Err(RpcFailure::unauthorized("sender is not an admin"));
    }

    match request.method.as_str() {
        "ping" => Ok("pong".to_owned()),
        "get_keys" => get_keys(bunker).await,
        "get_key_users" => get_key_users(bunker, request).await,
        "get_key_tokens" => get_key_tokens(bunker, request).await,
        "get_policies" => get_policies(bunker).await,
        "create_new_key" => create_new_key(bunker, request).await,
        "create_new_policy" => create_new_policy(bunker, request).await,
        "create_new_token" => create_new_token(bunker, sender, request).await,
        "unlock_key" => unlock_key(bunker, request).await,
        "rename_key_user" => rename_key_user(bunker, request).await,
        "revoke_user" => revoke_user(bunker, request).await,
        "create_account" => create_account(bunker, sender, request).await,
        "acl_response" => acl_response(bunker, request),
        other => Err(RpcFailure::bad_request(format!(
            "unknown admin command: {other}"
        ))),
    }
}

async fn get_keys(bunker: &Arc<Bunker>) -> Result<String, RpcFailure> {
    let config = bunker.load_config().await?;
    let mut keys = Vec::new();
    for (name, entry) in &config.keys {
        keys.push(serde_json::json!({
            "name": name,
            "pubkey": entry.pubkey.to_hex(),
            "encrypted": entry.is_encrypted(),
            "unlocked": bunker.keyring.is_unlocked(name).await,
        }));
    }
    Ok(Value::Array(keys).to_string())
}

async fn get_key_users(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let key_name = request.param(0);
    let users = bunker
        .store
        .list_key_users(key_name)
        .await
        .map_err(store_failure)?;
    serde_json::to_string(&users).map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn get_key_tokens(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let key_name = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key name required"))?;
    let tokens = bunker
        .store
        .list_tokens(key_name)
        .await
        .map_err(store_failure)?;
    serde_json::to_string(&tokens).map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn get_policies(bunker: &Arc<Bunker>) -> Result<String, RpcFailure> {
    let policies = bunker.store.list_policies().await.map_err(store_failure)?;
    let out: Vec<Value> = policies
        .into_iter()
        .map(|(policy, rules)| {
            serde_json::json!({
                "id": policy.id,
                "name": policy.name,
                "expiresAt": policy.expires_at,
                "createdAt": policy.created_at,
                "rules": rules,
            })
        })
        .collect();
    Ok(Value::Array(out).to_string())
}

async fn create_new_key(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let name = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key name required"))?
        .to_owned();
    let passphrase = request
        .param(1)
        .ok_or_else(|| RpcFailure::bad_request("passphrase required"))?;
    let nsec = request.param(2);
    let email = request.param(3);

    let config = bunker.load_config().await?;
    if config.keys.contains_key(&name) {
        return Err(RpcFailure::conflict(format!("key already exists: {name}")));
    }

    let (identity, generated) = match nsec {
        Some(material) => (
            Identity::from_secret_hex(material)
                .map_err(|e| RpcFailure::bad_request(e.to_string()))?,
            false,
        ),
        None => (Identity::generate(), true),
    };

    if generated {
        publish_skeleton_profile(bunker, &identity, &name, email, &config.user_relays).await;
    }

    let stored =
        StoredKey::encrypted(&identity, passphrase).map_err(|e| RpcFailure::internal(e.to_string()))?;
    bunker
        .persist_config(|c| {
            c.keys.insert(name.clone(), stored);
        })
        .await;

    let identity = Arc::new(identity);
    bunker.keyring.install(&name, Arc::clone(&identity)).await;
    bunker.notify_key_unlocked(&name);
    info!(key = %name, pubkey = %identity.public_key(), "key created");
    Ok(identity.public_key().to_hex())
}

/// Publish the skeleton profile for a freshly generated key: metadata (with
/// an avatar derived from the optional email hash), an empty follow list,
/// and the relay list.
async fn publish_skeleton_profile(
    bunker: &Arc<Bunker>,
    identity: &Identity,
    name: &str,
    email: Option<&str>,
    relays: &[String],
) {
    let mut profile = serde_json::json!({ "name": name, "display_name": name });
    if let Some(email) = email {
        let hash = hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()));
        profile["picture"] = Value::String(format!("https://www.gravatar.com/avatar/{hash}"));
    }

    let events = [
        identity.sign_event(EventTemplate::new(PROFILE_KIND, profile.to_string())),
        identity.sign_event(EventTemplate::new(CONTACTS_KIND, "")),
        identity.sign_event(EventTemplate::new(RELAY_LIST_KIND, "").with_tags(
            relays
                .iter()
                .map(|r| vec!["r".to_owned(), r.clone()])
                .collect(),
        )),
    ];
    for event in events {
        if let Err(e) = bunker.transport.publish(event).await {
            warn!(key = %name, error = %e, "skeleton profile publish failed");
        }
    }
}

async fn create_new_policy(
    bunker: &Arc<Bunker>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let spec_json = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("policy spec required"))?;
    let spec: PolicySpec = serde_json::from_str(spec_json)
        .map_err(|e| RpcFailure::bad_request(format!("bad policy spec: {e}")))?;
    let policy = bunker.store.create_policy(&spec).await.map_err(store_failure)?;
    serde_json::to_string(&policy).map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn create_new_token(
    bunker: &Arc<Bunker>,
    sender: &PublicKey,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let key_name = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key name required"))?;
    let client_name = request
        .param(1)
        .ok_or_else(|| RpcFailure::bad_request("client name required"))?;
    let policy_id: i64 = request
        .param(2)
        .ok_or_else(|| RpcFailure::bad_request("policy id required"))?
        .parse()
        .map_err(|_| RpcFailure::bad_request("policy id must be an integer"))?;
    let duration_hours = match request.param(3) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| RpcFailure::bad_request("duration must be hours"))?,
        ),
        None => None,
    };

    let token = bunker
        .store
        .create_token(key_name, client_name, policy_id, &sender.to_hex(), duration_hours)
        .await
        .map_err(store_failure)?;
    serde_json::to_string(&token).map_err(|e| RpcFailure::internal(e.to_string()))
}

async fn unlock_key(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let name = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key name required"))?;
    let passphrase = request.param(1).unwrap_or_default();

    if !bunker.key_allowed(name) {
        return Err(RpcFailure::unauthorized(format!(
            "key not whitelisted for this run: {name}"
        )));
    }

    let config = bunker.load_config().await?;
    let stored = config
        .keys
        .get(name)
        .ok_or_else(|| RpcFailure::not_found(format!("unknown key: {name}")))?;

    match bunker.keyring.unlock(name, stored, passphrase).await {
        Ok(_) => {
            bunker.notify_key_unlocked(name);
            Ok("true".to_owned())
        }
        Err(e) => Err(RpcFailure::new(
            RpcErrorKind::BadPassphraseOrCorrupt,
            e.to_string(),
        )),
    }
}

async fn rename_key_user(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let id: i64 = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key user id required"))?
        .parse()
        .map_err(|_| RpcFailure::bad_request("key user id must be an integer"))?;
    let description = request
        .param(1)
        .ok_or_else(|| RpcFailure::bad_request("description required"))?;
    bunker
        .store
        .rename_key_user(id, description)
        .await
        .map_err(store_failure)?;
    Ok("ok".to_owned())
}

async fn revoke_user(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let id: i64 = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("key user id required"))?
        .parse()
        .map_err(|_| RpcFailure::bad_request("key user id must be an integer"))?;
    bunker.store.revoke_key_user(id).await.map_err(store_failure)?;
    Ok("ok".to_owned())
}

/// Account creation arriving on the admin plane (open registration). Gated
/// through the engine like the user-plane path.
async fn create_account(
    bunker: &Arc<Bunker>,
    sender: &PublicKey,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let ctx = RequestContext {
        key_name: None,
        responder: &bunker.admin,
        plane_kind: ADMIN_RPC_KIND,
        remote: *sender,
        rpc_id: &request.id,
    };
    account::handle_create_account(bunker, &ctx, request).await
}

/// Explicit `acl_response` command: `[ledgerId, decisionJson]`.
fn acl_response(bunker: &Arc<Bunker>, request: &RpcRequest) -> Result<String, RpcFailure> {
    let ledger_id = request
        .param(0)
        .ok_or_else(|| RpcFailure::bad_request("request id required"))?;
    let decision_raw = request
        .param(1)
        .ok_or_else(|| RpcFailure::bad_request("decision required"))?;
    let decision = serde_json::from_str::<Value>(decision_raw)
        .unwrap_or_else(|_| Value::String(decision_raw.to_owned()));
    if bunker.resolve_approval(ledger_id, decision) {
        Ok("ok".to_owned())
    } else {
        Err(RpcFailure::not_found("no pending request with that id"))
    }
}

/// Print the connection string, persist it next to the config file, and
/// optionally DM it to every admin.
///
/// # Errors
///
/// Returns an error if `connection.txt` cannot be written.
pub async fn announce(bunker: &Arc<Bunker>) -> anyhow::Result<()> {
    let config = bunker.load_config().await?;
    let connection = config.connection_string(&bunker.admin.public_key());
    println!("{connection}");

    let path = bunker
        .config
        .path()
        .parent()
        .map_or_else(|| std::path::PathBuf::from("connection.txt"), |p| p.join("connection.txt"));
    tokio::fs::write(&path, format!("{connection}\n")).await?;
    info!(path = %path.display(), "connection string written");

    if config.notify_admins_on_boot {
        for admin in &config.admins {
            if let Err(e) = bunker
                .transport
                .send(&bunker.admin, admin, DIRECT_MESSAGE_KIND, &connection)
                .await
            {
                warn!(admin = %admin, error = %e, "boot notification failed");
            }
        }
    }
    Ok(())
}

