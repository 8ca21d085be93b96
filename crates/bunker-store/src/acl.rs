//! The ACL: `KeyUser` bindings and their signing conditions.
//!
//! Queried on every user-plane RPC. The decision algorithm:
//!
//! 1. No `KeyUser` row for `(key_name, user_pubkey)` → `Unknown`.
//! 2. Any `method='*', allowed=false` row → `Deny` (hard deny outranks all).
//! 3. Method-specific rows: for `sign_event` the scope must match the
//!    requested event kind or the literal `all`; other methods match on
//!    method alone.
//! 4. A matching row on a revoked `KeyUser` → `Deny`. Otherwise the row
//!    decides; explicit deny beats allow.
//! 5. No matching row → `Unknown` (the caller enters the approval path).
//!
//! Counted rules are enforced: an allow row carrying `max_usage_count`
//! decrements headroom on every use and stops allowing once exhausted.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use bunker_core::identity::PublicKey;
use bunker_core::rpc::Method;

use crate::error::StoreError;
use crate::{now_ts, Store};

/// Outcome of an ACL lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    Unknown,
}

/// A remote pubkey bound to a logical key name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub user_pubkey: String,
    pub description: Option<String>,
    pub revoked_at: Option<i64>,
    pub created_at: i64,
}

/// A single permission row for a `KeyUser`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: String,
    /// Empty string means unscoped.
    pub scope: String,
    pub allowed: bool,
    pub max_usage_count: Option<i64>,
    pub current_usage_count: i64,
}

fn key_user_from_row(row: &SqliteRow) -> KeyUser {
    KeyUser {
        id: row.get("id"),
        key_name: row.get("key_name"),
        user_pubkey: row.get("user_pubkey"),
        description: row.get("description"),
        revoked_at: row.get("revoked_at"),
        created_at: row.get("created_at"),
    }
}

fn condition_from_row(row: &SqliteRow) -> SigningCondition {
    SigningCondition {
        id: row.get("id"),
        key_user_id: row.get("key_user_id"),
        method: row.get("method"),
        scope: row.get("scope"),
        allowed: row.get::<i64, _>("allowed") != 0,
        max_usage_count: row.get("max_usage_count"),
        current_usage_count: row.get("current_usage_count"),
    }
}

/// Map a method + optional scope onto the stored scope column.
///
/// `sign_event` rows carry the event kind as text (or `all`); every other
/// method stores the empty string.
fn stored_scope(method: Method, scope: Option<&str>) -> String {
    match method {
        Method::SignEvent => scope.unwrap_or("all").to_owned(),
        _ => String::new(),
    }
}

impl Store {
    /// Decide whether `pubkey` may call `method` against `key_name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn lookup(
        &self,
        key_name: &str,
        pubkey: &PublicKey,
        method: Method,
        event_kind: Option<u32>,
    ) -> Result<Decision, StoreError> {
        let Some(user) = self.find_key_user(key_name, pubkey).await? else {
            return Ok(Decision::Unknown);
        };

        let hard_deny = sqlx::query(
            "SELECT id FROM signing_conditions
             WHERE key_user_id = ? AND method = '*' AND allowed = 0 LIMIT 1",
        )
        .bind(user.id)
        .fetch_optional(self.pool())
        .await?;
        if hard_deny.is_some() {
            return Ok(Decision::Deny);
        }

        let rows = match method {
            Method::SignEvent => {
                let kind_text = event_kind.map_or_else(|| "all".to_owned(), |k| k.to_string());
                sqlx::query(
                    "SELECT * FROM signing_conditions
                     WHERE key_user_id = ? AND method = 'sign_event'
                       AND scope IN (?, 'all')",
                )
                .bind(user.id)
                .bind(kind_text)
                .fetch_all(self.pool())
                .await?
            }
            other => {
                sqlx::query(
                    "SELECT * FROM signing_conditions
                     WHERE key_user_id = ? AND method = ?",
                )
                .bind(user.id)
                .bind(other.as_str())
                .fetch_all(self.pool())
                .await?
            }
        };
        let conditions: Vec<SigningCondition> = rows.iter().map(condition_from_row).collect();

        if conditions.is_empty() {
            return Ok(Decision::Unknown);
        }
        if user.revoked_at.is_some() {
            return Ok(Decision::Deny);
        }
        if conditions.iter().any(|c| !c.allowed) {
            return Ok(Decision::Deny);
        }

        // All matching rows allow. Counted rows spend headroom; the first row
        // with headroom (or no cap) wins.
        for condition in &conditions {
            match condition.max_usage_count {
                None => return Ok(Decision::Allow),
                Some(max) if condition.current_usage_count < max => {
                    sqlx::query(
                        "UPDATE signing_conditions
                         SET current_usage_count = current_usage_count + 1
                         WHERE id = ?",
                    )
                    .bind(condition.id)
                    .execute(self.pool())
                    .await?;
                    return Ok(Decision::Allow);
                }
                Some(_) => {}
            }
        }
        Ok(Decision::Deny)
    }

    /// Upsert the `KeyUser` and install an allow condition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn grant(
        &self,
        key_name: &str,
        pubkey: &PublicKey,
        method: Method,
        description: Option<&str>,
        scope: Option<&str>,
    ) -> Result<KeyUser, StoreError> {
        let user = self.upsert_key_user(key_name, pubkey, description).await?;
        self.put_condition(user.id, method, Some(stored_scope(method, scope)), true, None)
            .await?;
        Ok(user)
    }

    /// Upsert the `KeyUser` and install the wildcard hard deny.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn deny(&self, key_name: &str, pubkey: &PublicKey) -> Result<KeyUser, StoreError> {
        let user = self.upsert_key_user(key_name, pubkey, None).await?;
        self.put_condition(user.id, Method::Wildcard, None, false, None)
            .await?;
        Ok(user)
    }

    /// Find the `KeyUser` row for `(key_name, pubkey)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn find_key_user(
        &self,
        key_name: &str,
        pubkey: &PublicKey,
    ) -> Result<Option<KeyUser>, StoreError> {
        let row = sqlx::query("SELECT * FROM key_users WHERE key_name = ? AND user_pubkey = ?")
            .bind(key_name)
            .bind(pubkey.to_hex())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(key_user_from_row))
    }

    /// List key users, optionally restricted to one key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn list_key_users(
        &self,
        key_name: Option<&str>,
    ) -> Result<Vec<KeyUser>, StoreError> {
        let rows = match key_name {
            Some(name) => {
                sqlx::query("SELECT * FROM key_users WHERE key_name = ? ORDER BY id")
                    .bind(name)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM key_users ORDER BY id")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.iter().map(key_user_from_row).collect())
    }

    /// Conditions attached to a `KeyUser`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn list_conditions(
        &self,
        key_user_id: i64,
    ) -> Result<Vec<SigningCondition>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM signing_conditions WHERE key_user_id = ? ORDER BY id",
        )
        .bind(key_user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(condition_from_row).collect())
    }

    /// Set the human description on a `KeyUser`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the row does not exist.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn rename_key_user(
        &self,
        key_user_id: i64,
        description: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE key_users SET description = ? WHERE id = ?")
            .bind(description)
            .bind(key_user_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("key user"));
        }
        Ok(())
    }

    /// Soft-revoke a `KeyUser`. Lookup denies from here on; sessions already
    /// holding a connection are not torn down.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the row does not exist.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn revoke_key_user(&self, key_user_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE key_users SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL",
        )
        .bind(now_ts())
        .bind(key_user_id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            // Either absent or already revoked; distinguish for the caller.
            let exists = sqlx::query("SELECT id FROM key_users WHERE id = ?")
                .bind(key_user_id)
                .fetch_optional(self.pool())
                .await?;
            if exists.is_none() {
                return Err(StoreError::not_found("key user"));
            }
        }
        Ok(())
    }

    /// Redeem a token: upsert the `KeyUser`, install the baseline `connect`
    /// allow, materialize every policy rule, and mark the token redeemed.
    /// Transactional — either all rows land or none.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] for a missing token or policy.
    /// - [`StoreError::AlreadyRedeemed`] on a second redemption.
    /// - [`StoreError::Expired`] for expired tokens or policies.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn apply_token(
        &self,
        pubkey: &PublicKey,
        token: &str,
    ) -> Result<KeyUser, StoreError> {
        let now = now_ts();
        let mut tx = self.pool().begin().await?;

        let token_row = sqlx::query("SELECT * FROM tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("token"))?;
        let token_id: i64 = token_row.get("id");
        let key_name: String = token_row.get("key_name");
        let client_name: String = token_row.get("client_name");
        let policy_id: i64 = token_row.get("policy_id");
        let redeemed_at: Option<i64> = token_row.get("redeemed_at");
        let expires_at: Option<i64> = token_row.get("expires_at");

        if redeemed_at.is_some() {
            return Err(StoreError::AlreadyRedeemed);
        }
        if expires_at.is_some_and(|t| t < now) {
            return Err(StoreError::expired("token"));
        }

        let policy_row = sqlx::query("SELECT * FROM policies WHERE id = ?")
            .bind(policy_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("policy"))?;
        let policy_expires: Option<i64> = policy_row.get("expires_at");
        if policy_expires.is_some_and(|t| t < now) {
            return Err(StoreError::expired("policy"));
        }

        let user_row = sqlx::query(
            "INSERT INTO key_users (key_name, user_pubkey, description, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(key_name, user_pubkey)
                DO UPDATE SET description = COALESCE(key_users.description, excluded.description)
             RETURNING *",
        )
        .bind(&key_name)
        .bind(pubkey.to_hex())
        .bind(&client_name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let user = key_user_from_row(&user_row);

        // Baseline connect allow.
        sqlx::query(
            "INSERT INTO signing_conditions (key_user_id, method, scope, allowed)
             VALUES (?, 'connect', '', 1)
             ON CONFLICT(key_user_id, method, scope) DO UPDATE SET allowed = 1",
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        let rules = sqlx::query("SELECT * FROM policy_rules WHERE policy_id = ? ORDER BY id")
            .bind(policy_id)
            .fetch_all(&mut *tx)
            .await?;
        for rule in &rules {
            let method: String = rule.get("method");
            let kind: Option<String> = rule.get("kind");
            let max_usage: Option<i64> = rule.get("max_usage_count");
            let scope = if method == "sign_event" {
                kind.unwrap_or_else(|| "all".to_owned())
            } else {
                String::new()
            };
            sqlx::query(
                "INSERT INTO signing_conditions
                     (key_user_id, method, scope, allowed, max_usage_count)
                 VALUES (?, ?, ?, 1, ?)
                 ON CONFLICT(key_user_id, method, scope)
                    DO UPDATE SET allowed = 1, max_usage_count = excluded.max_usage_count",
            )
            .bind(user.id)
            .bind(&method)
            .bind(scope)
            .bind(max_usage)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE tokens SET redeemed_at = ?, redeemed_by_key_user_id = ? WHERE id = ?",
        )
        .bind(now)
        .bind(user.id)
        .bind(token_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(key = %key_name, user = %pubkey, "token redeemed");
        Ok(user)
    }

    async fn upsert_key_user(
        &self,
        key_name: &str,
        pubkey: &PublicKey,
        description: Option<&str>,
    ) -> Result<KeyUser, StoreError> {
        let row = sqlx::query(
            "INSERT INTO key_users (key_name, user_pubkey, description, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(key_name, user_pubkey)
                DO UPDATE SET description = COALESCE(excluded.description, key_users.description)
             RETURNING *",
        )
        .bind(key_name)
        .bind(pubkey.to_hex())
        .bind(description)
        .bind(now_ts())
        .fetch_one(self.pool())
        .await?;
        Ok(key_user_from_row(&row))
    }

    async fn put_condition(
        &self,
        key_user_id: i64,
        method: Method,
        scope: Option<String>,
        allowed: bool,
        max_usage_count: Option<i64>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO signing_conditions
                 (key_user_id, method, scope, allowed, max_usage_count)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(key_user_id, method, scope)
                DO UPDATE SET allowed = excluded.allowed,
                              max_usage_count = excluded.max_usage_count",
        )
        .bind(key_user_id)
        .bind(method.as_str())
        .bind(scope.unwrap_or_default())
        .bind(i64::from(allowed))
        .bind(max_usage_count)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pk(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    async fn store() -> Store {
        Store::open_memory().await.unwrap()
    }

    #[tokio::test]
    async fn unknown_without_key_user() {
        let store = store().await;
        let decision = store
            .lookup("alice", &pk(1), Method::SignEvent, Some(1))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Unknown);
    }

    #[tokio::test]
    async fn grant_then_lookup_allows() {
        let store = store().await;
        store
            .grant("alice", &pk(1), Method::SignEvent, Some("app"), Some("1"))
            .await
            .unwrap();
        let decision = store
            .lookup("alice", &pk(1), Method::SignEvent, Some(1))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn scope_mismatch_is_unknown() {
        let store = store().await;
        store
            .grant("alice", &pk(1), Method::SignEvent, None, Some("1"))
            .await
            .unwrap();
        let decision = store
            .lookup("alice", &pk(1), Method::SignEvent, Some(4))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Unknown);
    }

    #[tokio::test]
    async fn scope_all_matches_any_kind() {
        let store = store().await;
        store
            .grant("alice", &pk(1), Method::SignEvent, None, Some("all"))
            .await
            .unwrap();
        for kind in [1u32, 4, 30023] {
            let decision = store
                .lookup("alice", &pk(1), Method::SignEvent, Some(kind))
                .await
                .unwrap();
            assert_eq!(decision, Decision::Allow);
        }
    }

    #[tokio::test]
    async fn hard_deny_outranks_allow() {
        let store = store().await;
        store
            .grant("alice", &pk(1), Method::SignEvent, None, Some("all"))
            .await
            .unwrap();
        store.deny("alice", &pk(1)).await.unwrap();
        let decision = store
            .lookup("alice", &pk(1), Method::SignEvent, Some(1))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
        // Every other method is denied too.
        let decision = store
            .lookup("alice", &pk(1), Method::Encrypt, None)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
    }

    #[tokio::test]
    async fn revoked_user_is_denied_on_matching_rows() {
        let store = store().await;
        let user = store
            .grant("alice", &pk(1), Method::Connect, None, None)
            .await
            .unwrap();
        store.revoke_key_user(user.id).await.unwrap();
        let decision = store
            .lookup("alice", &pk(1), Method::Connect, None)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny);
    }

    #[tokio::test]
    async fn grants_are_idempotent() {
        let store = store().await;
        store
            .grant("alice", &pk(1), Method::SignEvent, None, Some("1"))
            .await
            .unwrap();
        store
            .grant("alice", &pk(1), Method::SignEvent, None, Some("1"))
            .await
            .unwrap();
        let users = store.list_key_users(Some("alice")).await.unwrap();
        assert_eq!(users.len(), 1);
        let conditions = store.list_conditions(users[0].id).await.unwrap();
        assert_eq!(conditions.len(), 1);
    }

    #[tokio::test]
    async fn rename_and_revoke_missing_user_fail() {
        let store = store().await;
        assert!(matches!(
            store.rename_key_user(999, "x").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.revoke_key_user(999).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn counted_rule_exhausts() {
        let store = store().await;
        let policy = store
            .create_policy(&crate::policy::PolicySpec {
                name: "limited".to_owned(),
                expires_at: None,
                rules: vec![crate::policy::RuleSpec {
                    method: "sign_event".to_owned(),
                    kind: Some("1".to_owned()),
                    max_usage_count: Some(2),
                }],
            })
            .await
            .unwrap();
        let token = store
            .create_token("alice", "app", policy.id, "admin", None)
            .await
            .unwrap();
        store.apply_token(&pk(1), &token.token).await.unwrap();

        for _ in 0..2 {
            assert_eq!(
                store
                    .lookup("alice", &pk(1), Method::SignEvent, Some(1))
                    .await
                    .unwrap(),
                Decision::Allow
            );
        }
        assert_eq!(
            store
                .lookup("alice", &pk(1), Method::SignEvent, Some(1))
                .await
                .unwrap(),
            Decision::Deny
        );
    }
}
