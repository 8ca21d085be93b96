//! The authorization engine.
//!
//! `permit` is the single gate every user-plane operation passes through:
//!
//! 1. Consult the ACL. `allow`/`deny` short-circuit.
//! 2. Open a request ledger row.
//! 3. With a configured `baseUrl`, hand the caller an `auth_url` (an
//!    out-of-band reply that does not resolve the RPC) and poll the ledger
//!    until the web flow settles the row or it expires.
//! 4. Otherwise fan an `acl` request out to every configured admin and take
//!    the first response. `always`/`never` write the ACL before settling, so
//!    the next identical request short-circuits at step 1; any other value
//!    is a one-shot decision.
//! 5. No response within the approval window resolves `TimedOut`, which the
//!    caller surfaces distinguishably from an explicit denial.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use bunker_core::event::ADMIN_RPC_KIND;
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::rpc::{Method, RpcFailure, RpcRequest, RpcResponse};
use bunker_store::acl::Decision;
use bunker_store::error::StoreError;

use crate::state::Bunker;

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    Approved,
    Denied(Option<String>),
    TimedOut,
}

/// Everything the engine needs to reach back to the suspended caller.
pub struct RequestContext<'a> {
    /// The key the operation targets; `None` for `create_account` before a
    /// key exists.
    pub key_name: Option<&'a str>,
    /// Identity out-of-band replies are sent from.
    pub responder: &'a Identity,
    /// Plane kind those replies travel on.
    pub plane_kind: u32,
    /// The authenticated caller.
    pub remote: PublicKey,
    /// The RPC id of the suspended request.
    pub rpc_id: &'a str,
}

/// Run the authorization algorithm for one request.
///
/// # Errors
///
/// Returns `Internal` on storage failures; approval outcomes (including
/// denial and timeout) are values, not errors.
pub async fn permit(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    method: Method,
    event_kind: Option<u32>,
    params: &str,
) -> Result<Permit, RpcFailure> {
    // Step 1: the ACL decides instantly when it can.
    if let Some(key_name) = ctx.key_name {
        match bunker
            .store
            .lookup(key_name, &ctx.remote, method, event_kind)
            .await
            .map_err(internal)?
        {
            Decision::Allow => return Ok(Permit::Approved),
            Decision::Deny => return Ok(Permit::Denied(None)),
            Decision::Unknown => {}
        }
    }

    // Step 2: open the ledger row that represents this suspension.
    let row = bunker
        .store
        .open_request(
            ctx.key_name,
            ctx.rpc_id,
            &ctx.remote,
            method.as_str(),
            Some(params),
        )
        .await
        .map_err(internal)?;

    let config = bunker.load_config().await?;

    if let Some(base_url) = config.base_url.as_deref() {
        web_approval(bunker, ctx, &row.id, base_url).await
    } else {
        admin_approval(bunker, ctx, &row.id, method, event_kind, params, &config.admins).await
    }
}

/// The URL-poll path: reply `auth_url` out of band, then watch the ledger.
async fn web_approval(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    ledger_id: &str,
    base_url: &str,
) -> Result<Permit, RpcFailure> {
    let url = format!("{}/requests/{}", base_url.trim_end_matches('/'), ledger_id);
    let reply = RpcResponse::auth_url(ctx.rpc_id, &url);
    let payload = serde_json::to_string(&reply).map_err(|e| RpcFailure::internal(e.to_string()))?;
    if let Err(e) = bunker
        .transport
        .send(ctx.responder, &ctx.remote, ctx.plane_kind, &payload)
        .await
    {
        warn!(error = %e, "auth_url reply failed; still polling");
    }
    info!(request = %ledger_id, url = %url, "awaiting web approval");

    match bunker
        .store
        .poll_until_settled(ledger_id, bunker.timings.poll)
        .await
    {
        Ok(row) if row.allowed == Some(true) => Ok(Permit::Approved),
        Ok(row) => Ok(Permit::Denied(row.payload)),
        Err(StoreError::Expired { .. }) => Ok(Permit::TimedOut),
        Err(e) => Err(internal(e)),
    }
}

/// The direct-admin path: parallel `acl` fanout, first response wins.
async fn admin_approval(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    ledger_id: &str,
    method: Method,
    event_kind: Option<u32>,
    params: &str,
    admins: &[PublicKey],
) -> Result<Permit, RpcFailure> {
    if admins.is_empty() {
        debug!("no admins configured; request cannot be approved");
        return Ok(Permit::TimedOut);
    }

    let description = match ctx.key_name {
        Some(key_name) => bunker
            .store
            .find_key_user(key_name, &ctx.remote)
            .await
            .map_err(internal)?
            .and_then(|u| u.description),
        None => None,
    };

    let acl_params = serde_json::json!({
        "keyName": ctx.key_name,
        "remotePubkey": ctx.remote.to_hex(),
        "method": method.as_str(),
        "params": params,
        "description": description,
    });
    let request = RpcRequest {
        id: ledger_id.to_owned(),
        method: "acl".to_owned(),
        params: vec![acl_params.to_string()],
    };
    let payload =
        serde_json::to_string(&request).map_err(|e| RpcFailure::internal(e.to_string()))?;

    let rx = bunker.register_approval(ledger_id);
    for admin in admins {
        if let Err(e) = bunker
            .transport
            .send(&bunker.admin, admin, ADMIN_RPC_KIND, &payload)
            .await
        {
            warn!(admin = %admin, error = %e, "acl fanout failed");
        }
    }
    info!(request = %ledger_id, admins = admins.len(), method = %method, "awaiting admin approval");

    let response = match tokio::time::timeout(bunker.timings.approval, rx).await {
        Ok(Ok(value)) => value,
        Ok(Err(_)) | Err(_) => {
            bunker.forget_approval(ledger_id);
            return Ok(Permit::TimedOut);
        }
    };

    apply_admin_response(bunker, ctx, ledger_id, method, event_kind, &response).await
}

/// Interpret the first admin response and settle the ledger row.
async fn apply_admin_response(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    ledger_id: &str,
    method: Method,
    event_kind: Option<u32>,
    response: &Value,
) -> Result<Permit, RpcFailure> {
    let empty = Vec::new();
    let items = response.as_array().unwrap_or(&empty);
    let verdict = items.first().and_then(Value::as_str);

    let permit = match verdict {
        Some("always") => {
            let description = items.get(1).and_then(Value::as_str);
            let scope = scope_from_value(items.get(2), event_kind);
            if let Some(key_name) = ctx.key_name {
                bunker
                    .store
                    .grant(key_name, &ctx.remote, method, description, scope.as_deref())
                    .await
                    .map_err(internal)?;
            }
            settle(bunker, ledger_id, true, None).await;
            Permit::Approved
        }
        Some("never") => {
            if let Some(key_name) = ctx.key_name {
                bunker
                    .store
                    .deny(key_name, &ctx.remote)
                    .await
                    .map_err(internal)?;
            }
            settle(bunker, ledger_id, false, Some("admin denied")).await;
            Permit::Denied(Some("admin denied".to_owned()))
        }
        _ if is_affirmative(response) => {
            // One-shot approval; no ACL write.
            settle(bunker, ledger_id, true, None).await;
            Permit::Approved
        }
        _ => {
            settle(bunker, ledger_id, false, None).await;
            Permit::Denied(None)
        }
    };
    Ok(permit)
}

async fn settle(bunker: &Arc<Bunker>, ledger_id: &str, allowed: bool, payload: Option<&str>) {
    // The row may already be gone (expired) or settled by the web flow; both
    // are fine — the resolved handle is what unblocks the caller.
    if let Err(e) = bunker.store.settle_request(ledger_id, allowed, payload).await {
        debug!(request = %ledger_id, error = %e, "ledger settle skipped");
    }
}

/// Map the admin-supplied scope value onto the stored scope text.
///
/// Accepts `{"kind": 1}`, `"1"`, `1`, or `"all"`; falls back to the kind the
/// request asked for.
fn scope_from_value(value: Option<&Value>, event_kind: Option<u32>) -> Option<String> {
    match value {
        Some(Value::Object(map)) => match map.get("kind") {
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::String(s)) => Some(s.clone()),
            _ => event_kind.map(|k| k.to_string()),
        },
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => event_kind.map(|k| k.to_string()),
    }
}

fn is_affirmative(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.as_str(), "yes" | "true" | "ok" | "approve"),
        _ => false,
    }
}

/// Translate a permit into the handler's continue/fail decision.
///
/// # Errors
///
/// `Denied` and `TimedOut` become their respective failures.
pub fn require_approved(permit: Permit) -> Result<(), RpcFailure> {
    match permit {
        Permit::Approved => Ok(()),
        Permit::Denied(reason) => Err(RpcFailure::denied(
            reason.unwrap_or_else(|| "not permitted".to_owned()),
        )),
        Permit::TimedOut => Err(RpcFailure::timed_out()),
    }
}

fn internal(e: StoreError) -> RpcFailure {
    RpcFailure::internal(e.to_string())
}

/// Map store errors onto their RPC error kinds at the dispatch boundary.
pub(crate) fn store_failure(e: StoreError) -> RpcFailure {
    use bunker_core::rpc::RpcErrorKind;
    match e {
        StoreError::NotFound { what } => RpcFailure::not_found(what),
        StoreError::AlreadyRedeemed => {
            RpcFailure::new(RpcErrorKind::AlreadyRedeemed, "token already redeemed")
        }
        StoreError::Expired { what } => {
            RpcFailure::new(RpcErrorKind::Expired, format!("{what} expired"))
        }
        StoreError::AlreadySettled => RpcFailure::conflict("request already settled"),
        StoreError::Sqlx(e) => RpcFailure::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_prefers_admin_supplied_kind() {
        let value = serde_json::json!({"kind": 1});
        assert_eq!(scope_from_value(Some(&value), Some(4)), Some("1".to_owned()));
    }

    #[test]
    fn scope_accepts_string_and_number() {
        assert_eq!(
            scope_from_value(Some(&serde_json::json!("all")), Some(4)),
            Some("all".to_owned())
        );
        assert_eq!(
            scope_from_value(Some(&serde_json::json!(7)), None),
            Some("7".to_owned())
        );
    }

    #[test]
    fn scope_falls_back_to_requested_kind() {
        assert_eq!(scope_from_value(None, Some(4)), Some("4".to_owned()));
        assert_eq!(scope_from_value(None, None), None);
    }

    #[test]
    fn affirmative_values() {
        assert!(is_affirmative(&serde_json::json!(true)));
        assert!(is_affirmative(&serde_json::json!("yes")));
        assert!(!is_affirmative(&serde_json::json!("nope")));
        assert!(!is_affirmative(&serde_json::json!(42)));
    }
}
