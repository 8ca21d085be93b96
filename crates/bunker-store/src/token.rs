//! One-shot tokens granting a policy's rights on a named key.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::StoreError;
use crate::{now_ts, Store};

/// A stored token. The `token` string itself is the credential a client
/// presents; redemption is one-shot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: i64,
    pub token: String,
    pub key_name: String,
    pub client_name: String,
    pub policy_id: i64,
    pub created_by: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub redeemed_at: Option<i64>,
    pub redeemed_by_key_user_id: Option<i64>,
}

fn token_from_row(row: &SqliteRow) -> Token {
    Token {
        id: row.get("id"),
        token: row.get("token"),
        key_name: row.get("key_name"),
        client_name: row.get("client_name"),
        policy_id: row.get("policy_id"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        redeemed_at: row.get("redeemed_at"),
        redeemed_by_key_user_id: row.get("redeemed_by_key_user_id"),
    }
}

impl Store {
    /// Issue a token for `key_name` bound to a policy.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the policy does not exist.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn create_token(
        &self,
        key_name: &str,
        client_name: &str,
        policy_id: i64,
        created_by: &str,
        duration_hours: Option<i64>,
    ) -> Result<Token, StoreError> {
        // Validate the policy up front so the token never dangles.
        self.get_policy(policy_id).await?;

        let token = uuid::Uuid::new_v4().simple().to_string();
        let now = now_ts();
        let expires_at = duration_hours.map(|h| now + h * 3600);

        let row = sqlx::query(
            "INSERT INTO tokens
                 (token, key_name, client_name, policy_id, created_by, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(&token)
        .bind(key_name)
        .bind(client_name)
        .bind(policy_id)
        .bind(created_by)
        .bind(now)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await?;
        tracing::info!(key = %key_name, client = %client_name, "token issued");
        Ok(token_from_row(&row))
    }

    /// Tokens issued for a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn list_tokens(&self, key_name: &str) -> Result<Vec<Token>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tokens WHERE key_name = ? ORDER BY id")
            .bind(key_name)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(token_from_row).collect())
    }

    /// Look up a token by its credential string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn find_token(&self, token: &str) -> Result<Option<Token>, StoreError> {
        let row = sqlx::query("SELECT * FROM tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(token_from_row))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::{PolicySpec, RuleSpec};
    use bunker_core::identity::PublicKey;

    async fn store_with_policy() -> (Store, i64) {
        let store = Store::open_memory().await.unwrap();
        let policy = store
            .create_policy(&PolicySpec {
                name: "p".to_owned(),
                expires_at: None,
                rules: vec![RuleSpec {
                    method: "encrypt".to_owned(),
                    kind: None,
                    max_usage_count: None,
                }],
            })
            .await
            .unwrap();
        (store, policy.id)
    }

    #[tokio::test]
    async fn create_token_requires_policy() {
        let store = Store::open_memory().await.unwrap();
        assert!(matches!(
            store.create_token("alice", "app", 7, "admin", None).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn token_expiry_is_stamped() {
        let (store, policy_id) = store_with_policy().await;
        let token = store
            .create_token("alice", "app", policy_id, "admin", Some(2))
            .await
            .unwrap();
        let expires = token.expires_at.unwrap();
        assert!(expires > token.created_at);
        assert_eq!(expires - token.created_at, 2 * 3600);
    }

    #[tokio::test]
    async fn redemption_is_one_shot() {
        let (store, policy_id) = store_with_policy().await;
        let token = store
            .create_token("alice", "app", policy_id, "admin", None)
            .await
            .unwrap();
        let pubkey = PublicKey::from_bytes([9; 32]);

        store.apply_token(&pubkey, &token.token).await.unwrap();
        let second = store.apply_token(&pubkey, &token.token).await;
        assert!(matches!(second, Err(StoreError::AlreadyRedeemed)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (store, policy_id) = store_with_policy().await;
        let token = store
            .create_token("alice", "app", policy_id, "admin", Some(1))
            .await
            .unwrap();
        // Force the expiry into the past.
        sqlx::query("UPDATE tokens SET expires_at = ? WHERE id = ?")
            .bind(crate::now_ts() - 10)
            .bind(token.id)
            .execute(store.pool())
            .await
            .unwrap();
        let result = store
            .apply_token(&PublicKey::from_bytes([9; 32]), &token.token)
            .await;
        assert!(matches!(result, Err(StoreError::Expired { .. })));
    }

    #[tokio::test]
    async fn redemption_materializes_rules() {
        let (store, policy_id) = store_with_policy().await;
        let token = store
            .create_token("alice", "app", policy_id, "admin", None)
            .await
            .unwrap();
        let pubkey = PublicKey::from_bytes([9; 32]);
        let user = store.apply_token(&pubkey, &token.token).await.unwrap();

        let conditions = store.list_conditions(user.id).await.unwrap();
        let methods: Vec<&str> = conditions.iter().map(|c| c.method.as_str()).collect();
        assert!(methods.contains(&"connect"));
        assert!(methods.contains(&"encrypt"));

        let redeemed = store.find_token(&token.token).await.unwrap().unwrap();
        assert!(redeemed.redeemed_at.is_some());
        assert_eq!(redeemed.redeemed_by_key_user_id, Some(user.id));
    }
}
