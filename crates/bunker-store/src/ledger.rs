//! The request ledger: short-lived records of pending approvals.
//!
//! A row is opened when a request enters the approval path and settled by an
//! admin response or the web flow. `allowed IS NULL` means pending; any
//! transition to non-null is terminal. A per-row expiry task deletes the row
//! after the ledger TTL regardless of state, so nothing pends forever.

use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use bunker_core::identity::PublicKey;

use crate::error::StoreError;
use crate::{now_ts, Store};

/// A ledger row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRow {
    /// Internal row id; also the path segment of approval URLs.
    pub id: String,
    pub key_name: Option<String>,
    /// The RPC id of the suspended user request.
    pub request_id: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params: Option<String>,
    pub allowed: Option<bool>,
    pub payload: Option<String>,
    pub created_at: i64,
}

impl RequestRow {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.allowed.is_none()
    }
}

fn request_from_row(row: &SqliteRow) -> RequestRow {
    RequestRow {
        id: row.get("id"),
        key_name: row.get("key_name"),
        request_id: row.get("request_id"),
        remote_pubkey: row.get("remote_pubkey"),
        method: row.get("method"),
        params: row.get("params"),
        allowed: row.get::<Option<i64>, _>("allowed").map(|v| v != 0),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}

impl Store {
    /// Open a pending row and schedule its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn open_request(
        &self,
        key_name: Option<&str>,
        request_id: &str,
        remote_pubkey: &PublicKey,
        method: &str,
        params: Option<&str>,
    ) -> Result<RequestRow, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let row = sqlx::query(
            "INSERT INTO requests
                 (id, key_name, request_id, remote_pubkey, method, params, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&id)
        .bind(key_name)
        .bind(request_id)
        .bind(remote_pubkey.to_hex())
        .bind(method)
        .bind(params)
        .bind(now_ts())
        .fetch_one(self.pool())
        .await?;

        // Expiry deletes the row regardless of state.
        let pool = self.pool().clone();
        let ttl = self.ledger_ttl();
        let expire_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(e) = sqlx::query("DELETE FROM requests WHERE id = ?")
                .bind(&expire_id)
                .execute(&pool)
                .await
            {
                tracing::warn!(request = %expire_id, error = %e, "ledger expiry failed");
            }
        });

        Ok(request_from_row(&row))
    }

    /// Settle a pending row. Transitions are terminal.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the row is gone (expired or never existed).
    /// - [`StoreError::AlreadySettled`] if it was settled before.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn settle_request(
        &self,
        id: &str,
        allowed: bool,
        payload: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE requests SET allowed = ?, payload = ? WHERE id = ? AND allowed IS NULL",
        )
        .bind(i64::from(allowed))
        .bind(payload)
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return match self.find_request(id).await? {
                Some(_) => Err(StoreError::AlreadySettled),
                None => Err(StoreError::not_found("request")),
            };
        }
        Ok(())
    }

    /// Fetch a row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn find_request(&self, id: &str) -> Result<Option<RequestRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(request_from_row))
    }

    /// Poll until the row settles or expires.
    ///
    /// Returns the settled row; a row that disappears (expiry) maps to
    /// [`StoreError::Expired`].
    ///
    /// # Errors
    ///
    /// - [`StoreError::Expired`] when the row is deleted before settling.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn poll_until_settled(
        &self,
        id: &str,
        interval: Duration,
    ) -> Result<RequestRow, StoreError> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.find_request(id).await? {
                None => return Err(StoreError::expired("request")),
                Some(row) if !row.is_pending() => return Ok(row),
                Some(_) => {}
            }
        }
    }
}
