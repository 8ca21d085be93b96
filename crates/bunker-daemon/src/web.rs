//! The approval web API.
//!
//! JSON endpoints behind the `baseUrl` approval flow. The HTML front end is
//! a separate deployment; these handlers are what it calls:
//!
//! - `GET /requests/:id` — the pending ledger row.
//! - `POST /requests/:id/approve` — grant (when `always`) and settle allowed.
//! - `POST /requests/:id/deny` — settle denied.
//!
//! The engine polls the ledger, so settling here resumes the suspended RPC.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;

use bunker_core::identity::PublicKey;
use bunker_core::rpc::Method;
use bunker_store::ledger::RequestRow;

use crate::state::Bunker;

type HandlerError = (StatusCode, Json<Value>);

/// Approval body. `always` persists the grant; the optional scope overrides
/// the kind recorded in the request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApproveBody {
    pub always: bool,
    pub description: Option<String>,
    pub scope: Option<String>,
}

/// Build the approval router.
pub fn router(bunker: Arc<Bunker>) -> Router {
    Router::new()
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/approve", post(approve_request))
        .route("/requests/:id/deny", post(deny_request))
        .layer(TraceLayer::new_for_http())
        .with_state(bunker)
}

/// Serve the approval API until the listener fails.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn run(bunker: Arc<Bunker>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(bunker);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "approval web API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_request(
    State(bunker): State<Arc<Bunker>>,
    Path(id): Path<String>,
) -> Result<Json<RequestRow>, HandlerError> {
    let row = find_row(&bunker, &id).await?;
    Ok(Json(row))
}

async fn approve_request(
    State(bunker): State<Arc<Bunker>>,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<Json<Value>, HandlerError> {
    let Json(body) = body.unwrap_or_default();
    let row = find_row(&bunker, &id).await?;
    if !row.is_pending() {
        return Err(error(StatusCode::CONFLICT, "request already settled"));
    }

    if body.always {
        install_grant(&bunker, &row, &body).await?;
    }

    bunker
        .store
        .settle_request(&id, true, None)
        .await
        .map_err(internal)?;
    info!(request = %id, always = body.always, "request approved via web");
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn deny_request(
    State(bunker): State<Arc<Bunker>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HandlerError> {
    let row = find_row(&bunker, &id).await?;
    if !row.is_pending() {
        return Err(error(StatusCode::CONFLICT, "request already settled"));
    }
    bunker
        .store
        .settle_request(&id, false, Some("denied via web"))
        .await
        .map_err(internal)?;
    info!(request = %id, "request denied via web");
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Persist the grant an `always` approval implies. Approving `connect` also
/// installs `sign_event`/`all` so a freshly connected client can post
/// without a second round-trip.
async fn install_grant(
    bunker: &Arc<Bunker>,
    row: &RequestRow,
    body: &ApproveBody,
) -> Result<(), HandlerError> {
    let Some(key_name) = row.key_name.as_deref() else {
        return Ok(());
    };
    let method: Method = row
        .method
        .parse()
        .map_err(|_| error(StatusCode::UNPROCESSABLE_ENTITY, "request method unknown"))?;
    let remote: PublicKey = row
        .remote_pubkey
        .parse()
        .map_err(|_| error(StatusCode::UNPROCESSABLE_ENTITY, "request pubkey malformed"))?;

    let scope = match method {
        Method::SignEvent => body
            .scope
            .clone()
            .or_else(|| kind_from_params(row.params.as_deref())),
        _ => None,
    };

    bunker
        .store
        .grant(
            key_name,
            &remote,
            method,
            body.description.as_deref(),
            scope.as_deref(),
        )
        .await
        .map_err(internal)?;

    if method == Method::Connect {
        bunker
            .store
            .grant(
                key_name,
                &remote,
                Method::SignEvent,
                body.description.as_deref(),
                Some("all"),
            )
            .await
            .map_err(internal)?;
    }
    Ok(())
}

/// For `sign_event` rows the params column holds the full event JSON; pull
/// the kind out of it for scoping.
fn kind_from_params(params: Option<&str>) -> Option<String> {
    let value: Value = serde_json::from_str(params?).ok()?;
    value.get("kind").and_then(Value::as_u64).map(|k| k.to_string())
}

async fn find_row(bunker: &Arc<Bunker>, id: &str) -> Result<RequestRow, HandlerError> {
    bunker
        .store
        .find_request(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "no such request"))
}

fn error(status: StatusCode, message: &str) -> HandlerError {
    (status, Json(serde_json::json!({ "error": message })))
}

fn internal(e: bunker_store::error::StoreError) -> HandlerError {
    error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_extraction_from_event_json() {
        let params = r#"{"kind": 30023, "content": "post", "tags": [], "created_at": 1}"#;
        assert_eq!(kind_from_params(Some(params)), Some("30023".to_owned()));
        assert_eq!(kind_from_params(Some("not json")), None);
        assert_eq!(kind_from_params(None), None);
    }
}
