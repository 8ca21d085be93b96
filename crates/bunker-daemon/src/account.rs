//! Account provisioning.
//!
//! `create_account(username?, domain?, email?)` validates the username and
//! domain, passes the authorization gate, then: generates a key, appends the
//! mapping to the domain's identity file, optionally provisions a lightning
//! wallet, stores the key raw (no operator passphrase exists at this point),
//! and grants the calling pubkey full rights on the new key.
//!
//! Validation runs before the gate so a reserved username fails fast with
//! `Conflict` and never reaches the approval path.

use std::sync::Arc;

use rand::RngCore;
use serde_json::Value;
use tracing::{info, warn};

use bunker_core::config::{BunkerConfig, DomainConfig};
use bunker_core::event::{EventTemplate, PROFILE_KIND};
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::keys::StoredKey;
use bunker_core::rpc::{Method, RpcFailure, RpcRequest};

use crate::authorize::{self, require_approved, store_failure, RequestContext};
use crate::identity_file::IdentityFile;
use crate::state::Bunker;
use crate::wallet::{HttpWalletClient, WalletProvisioner};

/// Usernames that can never be registered.
pub const RESERVED_USERNAMES: [&str; 5] = ["admin", "root", "_", "administrator", "__"];

/// Full create_account flow: validate, authorize, provision.
///
/// # Errors
///
/// `Conflict` for reserved/taken usernames and unknown domains; `Denied` /
/// `TimedOut` from the gate; `Internal` on storage faults.
pub async fn handle_create_account(
    bunker: &Arc<Bunker>,
    ctx: &RequestContext<'_>,
    request: &RpcRequest,
) -> Result<String, RpcFailure> {
    let config = bunker.load_config().await?;

    let username = match request.param(0) {
        Some(name) => name.to_owned(),
        None => random_username(),
    };
    let email = request.param(2);
    let (domain, domain_config) = resolve_domain(&config, request.param(1))?;
    validate_username(&username)?;

    let permit = authorize::permit(
        bunker,
        ctx,
        Method::CreateAccount,
        None,
        &format!("{username}@{domain}"),
    )
    .await?;
    require_approved(permit)?;

    let pubkey = provision(
        bunker,
        &config,
        &ctx.remote,
        &username,
        &domain,
        &domain_config,
        email,
    )
    .await?;
    Ok(pubkey.to_hex())
}

fn validate_username(username: &str) -> Result<(), RpcFailure> {
    let lowered = username.to_lowercase();
    if RESERVED_USERNAMES.contains(&lowered.as_str()) {
        return Err(RpcFailure::conflict(format!(
            "username is reserved: {username}"
        )));
    }
    if username.is_empty() || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RpcFailure::bad_request(format!(
            "username must be alphanumeric: {username}"
        )));
    }
    Ok(())
}

fn resolve_domain(
    config: &BunkerConfig,
    requested: Option<&str>,
) -> Result<(String, DomainConfig), RpcFailure> {
    match requested {
        Some(domain) => config
            .domains
            .get(domain)
            .map(|d| (domain.to_owned(), d.clone()))
            .ok_or_else(|| RpcFailure::conflict(format!("unknown domain: {domain}"))),
        None => config
            .domains
            .iter()
            .next()
            .map(|(name, d)| (name.clone(), d.clone()))
            .ok_or_else(|| RpcFailure::conflict("no domains configured")),
    }
}

async fn provision(
    bunker: &Arc<Bunker>,
    config: &BunkerConfig,
    caller: &PublicKey,
    username: &str,
    domain: &str,
    domain_config: &DomainConfig,
    email: Option<&str>,
) -> Result<PublicKey, RpcFailure> {
    let mut identities = IdentityFile::load(&domain_config.identity_file)
        .await
        .map_err(|e| RpcFailure::internal(e.to_string()))?;
    if identities.names.contains_key(username) {
        return Err(RpcFailure::conflict(format!(
            "username is taken: {username}"
        )));
    }

    let identity = Identity::generate();
    let pubkey = identity.public_key();

    identities
        .names
        .insert(username.to_owned(), pubkey.to_hex());
    identities
        .nip46
        .insert(pubkey.to_hex(), config.user_relays.clone());
    identities
        .save(&domain_config.identity_file)
        .await
        .map_err(|e| RpcFailure::internal(e.to_string()))?;

    if let Some(wallet) = &domain_config.wallet {
        let client = HttpWalletClient::new(&wallet.endpoint, &wallet.api_key);
        // Wallet provisioning is best-effort; the account stands without it.
        if let Err(e) = client.provision(username, domain, &pubkey).await {
            warn!(user = %username, error = %e, "wallet provisioning failed");
        }
    }

    // Raw entry: account keys have no operator passphrase.
    let stored = StoredKey::raw(&identity);
    let key_name = username.to_owned();
    bunker
        .persist_config(|c| {
            c.keys.insert(key_name.clone(), stored);
        })
        .await;

    let identity = Arc::new(identity);
    bunker.keyring.install(username, Arc::clone(&identity)).await;
    bunker.notify_key_unlocked(username);

    publish_profile(bunker, &identity, username, domain, domain_config, email).await;

    // The caller asked for this account; hand it the full method set.
    for (method, scope) in [
        (Method::Connect, None),
        (Method::SignEvent, Some("all")),
        (Method::Encrypt, None),
        (Method::Decrypt, None),
    ] {
        bunker
            .store
            .grant(username, caller, method, Some("account owner"), scope)
            .await
            .map_err(store_failure)?;
    }

    info!(user = %username, domain = %domain, pubkey = %pubkey, "account created");
    Ok(pubkey)
}

async fn publish_profile(
    bunker: &Arc<Bunker>,
    identity: &Arc<Identity>,
    username: &str,
    domain: &str,
    domain_config: &DomainConfig,
    email: Option<&str>,
) {
    let mut profile = domain_config
        .default_profile
        .clone()
        .unwrap_or_else(|| serde_json::json!({}));
    if let Value::Object(map) = &mut profile {
        map.entry("name")
            .or_insert_with(|| Value::String(username.to_owned()));
        map.insert(
            "nip05".to_owned(),
            Value::String(format!("{username}@{domain}")),
        );
        if let Some(email) = email {
            use sha2::Digest;
            let hash = hex::encode(sha2::Sha256::digest(email.trim().to_lowercase().as_bytes()));
            map.entry("picture").or_insert_with(|| {
                Value::String(format!("https://www.gravatar.com/avatar/{hash}"))
            });
        }
    }

    let event = identity.sign_event(EventTemplate::new(PROFILE_KIND, profile.to_string()));
    if let Err(e) = bunker.transport.publish(event).await {
        warn!(user = %username, error = %e, "profile publish failed");
    }
}

fn random_username() -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("user{}", hex::encode(bytes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reserved_usernames_conflict() {
        for name in ["admin", "root", "_", "administrator", "__", "Admin", "ROOT"] {
            let result = validate_username(name);
            assert!(result.is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn ordinary_usernames_pass() {
        for name in ["alice", "bob42", "carol_d", "dave-e"] {
            assert!(validate_username(name).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn random_usernames_are_well_formed() {
        let name = random_username();
        assert!(name.starts_with("user"));
        assert!(validate_username(&name).is_ok());
    }

    #[test]
    fn unknown_domain_conflicts() {
        let config = BunkerConfig::default();
        let result = resolve_domain(&config, Some("nowhere.example"));
        assert!(result.is_err());
        // No domains configured at all is also a conflict.
        assert!(resolve_domain(&config, None).is_err());
    }
}
