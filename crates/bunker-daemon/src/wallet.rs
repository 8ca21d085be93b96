//! Lightning wallet provisioning.
//!
//! Account creation can optionally open a wallet for the new user. The
//! backend is reached over HTTP (LNbits-style user manager API); failures
//! are logged and never block the account.

use async_trait::async_trait;

use bunker_core::identity::PublicKey;

/// Errors from wallet backends.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("wallet backend returned status {status}")]
    Status { status: u16 },
}

/// A backend capable of opening a wallet for a new account.
#[async_trait]
pub trait WalletProvisioner: Send + Sync {
    async fn provision(
        &self,
        username: &str,
        domain: &str,
        pubkey: &PublicKey,
    ) -> Result<(), WalletError>;
}

/// HTTP client for an LNbits-style user manager endpoint.
#[derive(Debug, Clone)]
pub struct HttpWalletClient {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpWalletClient {
    #[must_use]
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl WalletProvisioner for HttpWalletClient {
    async fn provision(
        &self,
        username: &str,
        domain: &str,
        pubkey: &PublicKey,
    ) -> Result<(), WalletError> {
        let body = serde_json::json!({
            "user_name": format!("{username}@{domain}"),
            "wallet_name": username,
            "pubkey": pubkey.to_hex(),
        });
        let response = self
            .client
            .post(format!("{}/usermanager/api/v1/users", self.endpoint))
            .header("X-Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WalletError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}
