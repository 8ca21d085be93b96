//! Policies: named rule bundles applied to a `KeyUser` via token redemption.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::StoreError;
use crate::{now_ts, Store};

/// A stored policy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

/// A rule within a stored policy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: i64,
    pub policy_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub max_usage_count: Option<i64>,
}

/// The JSON shape admins submit to `create_new_policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub rules: Vec<RuleSpec>,
}

/// One rule in a [`PolicySpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub method: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub max_usage_count: Option<i64>,
}

fn policy_from_row(row: &SqliteRow) -> Policy {
    Policy {
        id: row.get("id"),
        name: row.get("name"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}

fn rule_from_row(row: &SqliteRow) -> PolicyRule {
    PolicyRule {
        id: row.get("id"),
        policy_id: row.get("policy_id"),
        method: row.get("method"),
        kind: row.get("kind"),
        max_usage_count: row.get("max_usage_count"),
    }
}

impl Store {
    /// Create a policy and its rules.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn create_policy(&self, spec: &PolicySpec) -> Result<Policy, StoreError> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(
            "INSERT INTO policies (name, expires_at, created_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(&spec.name)
        .bind(spec.expires_at)
        .bind(now_ts())
        .fetch_one(&mut *tx)
        .await?;
        let policy = policy_from_row(&row);

        for rule in &spec.rules {
            sqlx::query(
                "INSERT INTO policy_rules (policy_id, method, kind, max_usage_count)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(policy.id)
            .bind(&rule.method)
            .bind(&rule.kind)
            .bind(rule.max_usage_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::info!(policy = %policy.name, rules = spec.rules.len(), "policy created");
        Ok(policy)
    }

    /// Fetch a policy with its rules.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the policy does not exist.
    /// - [`StoreError::Sqlx`] on database failure.
    pub async fn get_policy(&self, id: i64) -> Result<(Policy, Vec<PolicyRule>), StoreError> {
        let row = sqlx::query("SELECT * FROM policies WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::not_found("policy"))?;
        let policy = policy_from_row(&row);
        let rules = sqlx::query("SELECT * FROM policy_rules WHERE policy_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(self.pool())
            .await?;
        Ok((policy, rules.iter().map(rule_from_row).collect()))
    }

    /// All policies with their rules.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlx`] on database failure.
    pub async fn list_policies(&self) -> Result<Vec<(Policy, Vec<PolicyRule>)>, StoreError> {
        let rows = sqlx::query("SELECT * FROM policies ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let policy = policy_from_row(row);
            let rules = sqlx::query("SELECT * FROM policy_rules WHERE policy_id = ? ORDER BY id")
                .bind(policy.id)
                .fetch_all(self.pool())
                .await?;
            out.push((policy, rules.iter().map(rule_from_row).collect()));
        }
        Ok(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_policy() {
        let store = Store::open_memory().await.unwrap();
        let spec = PolicySpec {
            name: "social".to_owned(),
            expires_at: None,
            rules: vec![
                RuleSpec {
                    method: "sign_event".to_owned(),
                    kind: Some("1".to_owned()),
                    max_usage_count: Some(10),
                },
                RuleSpec {
                    method: "encrypt".to_owned(),
                    kind: None,
                    max_usage_count: None,
                },
            ],
        };
        let policy = store.create_policy(&spec).await.unwrap();
        let (fetched, rules) = store.get_policy(policy.id).await.unwrap();
        assert_eq!(fetched.name, "social");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].kind.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn get_missing_policy_fails() {
        let store = Store::open_memory().await.unwrap();
        assert!(matches!(
            store.get_policy(42).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn policy_spec_parses_from_json() {
        let spec: PolicySpec = serde_json::from_str(
            r#"{"name": "p", "rules": [{"method": "sign_event", "kind": "1", "maxUsageCount": 5}]}"#,
        )
        .unwrap();
        assert_eq!(spec.rules[0].max_usage_count, Some(5));
    }
}
