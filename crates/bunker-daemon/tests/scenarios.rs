//! End-to-end scenarios over the in-process transport.
//!
//! Each test boots a full bunker (both planes, in-memory store, temp config)
//! and drives it from simulated remote clients and admins.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;

use bunker_core::config::{ConfigStore, DomainConfig};
use bunker_core::event::{SignedEvent, ADMIN_RPC_KIND, USER_RPC_KIND};
use bunker_core::identity::{Identity, PublicKey};
use bunker_core::rpc::{RpcRequest, RpcResponse};
use bunker_daemon::{admin, user, Bunker, BunkerChannels, Timings};
use bunker_store::Store;
use bunker_transport::{Envelope, MemoryTransport, Transport};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

struct TestBunker {
    bunker: Arc<Bunker>,
    transport: Arc<MemoryTransport>,
    alice_pubkey: PublicKey,
    ping_rx: mpsc::UnboundedReceiver<()>,
    _dir: tempfile::TempDir,
}

#[derive(Default)]
struct BootSpec {
    admins: Vec<PublicKey>,
    base_url: Option<String>,
    with_domain: bool,
}

/// Boot a bunker with one unlocked key named `alice`.
async fn boot(spec: BootSpec) -> TestBunker {
    let dir = tempfile::tempdir().unwrap();
    let config_store = ConfigStore::new(dir.path().join("nsecbunker.json"));
    config_store.load().await.unwrap();

    let identity_file = dir.path().join("nostr.json");
    config_store
        .update(|c| {
            c.admins = spec.admins.clone();
            c.base_url = spec.base_url.clone();
            c.user_relays = vec!["wss://relay.example".to_owned()];
            if spec.with_domain {
                c.domains.insert(
                    "example.com".to_owned(),
                    DomainConfig {
                        identity_file: identity_file.clone(),
                        default_profile: None,
                        wallet: None,
                    },
                );
            }
        })
        .await
        .unwrap();

    let store = Store::open_memory()
        .await
        .unwrap()
        .with_ledger_ttl(Duration::from_secs(2));
    let transport = Arc::new(MemoryTransport::new());
    let config = config_store.load().await.unwrap();
    let admin_identity = config.admin_identity().unwrap();

    let timings = Timings {
        approval: Duration::from_millis(500),
        poll: Duration::from_millis(20),
        ping_interval: Duration::from_secs(60),
        watchdog: Duration::from_secs(120),
    };
    let (bunker, channels) = Bunker::new(
        config_store,
        store,
        Arc::clone(&transport) as Arc<dyn Transport>,
        admin_identity,
        timings,
        Vec::new(),
    );
    let BunkerChannels { key_rx, ping_rx } = channels;

    let alice = Arc::new(Identity::generate());
    let alice_pubkey = alice.public_key();
    bunker.keyring.install("alice", alice).await;

    tokio::spawn(admin::run(Arc::clone(&bunker)));
    tokio::spawn(user::run(Arc::clone(&bunker), key_rx));
    // Let the plane subscriptions land before the tests start sending.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestBunker {
        bunker,
        transport,
        alice_pubkey,
        ping_rx,
        _dir: dir,
    }
}

/// A simulated remote peer (client or admin app).
struct Peer {
    identity: Identity,
    transport: Arc<MemoryTransport>,
    kind: u32,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Peer {
    async fn new(transport: &Arc<MemoryTransport>, kind: u32) -> Self {
        Self::with_identity(transport, Identity::generate(), kind).await
    }

    async fn with_identity(
        transport: &Arc<MemoryTransport>,
        identity: Identity,
        kind: u32,
    ) -> Self {
        let rx = transport.subscribe(&identity, kind).await.unwrap();
        Self {
            identity,
            transport: Arc::clone(transport),
            kind,
            rx,
        }
    }

    fn pubkey(&self) -> PublicKey {
        self.identity.public_key()
    }

    async fn send_request(&self, to: &PublicKey, request: &RpcRequest) {
        let payload = serde_json::to_string(request).unwrap();
        self.transport
            .send(&self.identity, to, self.kind, &payload)
            .await
            .unwrap();
    }

    async fn send_response(&self, to: &PublicKey, response: &RpcResponse) {
        let payload = serde_json::to_string(response).unwrap();
        self.transport
            .send(&self.identity, to, self.kind, &payload)
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for an envelope")
            .expect("channel closed")
    }

    async fn recv_response(&mut self) -> RpcResponse {
        let envelope = self.recv().await;
        serde_json::from_str(&envelope.payload).unwrap()
    }

    fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

fn sign_event_request(kind: u32) -> RpcRequest {
    let event = serde_json::json!({
        "kind": kind,
        "content": "hello world",
        "tags": [],
        "created_at": 1_700_000_000,
    });
    RpcRequest::new("sign_event", vec![event.to_string()])
}

fn always_response(id: &str, description: &str, kind: u32) -> RpcResponse {
    let decision = serde_json::json!(["always", description, { "kind": kind }]);
    RpcResponse::ok(id, decision.to_string())
}

// ── Scenario 1 & 2: first request needs approval, second does not ────

#[tokio::test]
async fn direct_admin_approval_then_short_circuit() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut admin_app =
        Peer::with_identity(&harness.transport, admin_identity, ADMIN_RPC_KIND).await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    // First signing request suspends and fans out to the admin.
    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;

    let fanout = admin_app.recv().await;
    let acl_request: RpcRequest = serde_json::from_str(&fanout.payload).unwrap();
    assert_eq!(acl_request.method, "acl");
    let acl_params: Value = serde_json::from_str(&acl_request.params[0]).unwrap();
    assert_eq!(acl_params["keyName"], "alice");
    assert_eq!(acl_params["method"], "sign_event");

    admin_app
        .send_response(
            &harness.bunker.admin.public_key(),
            &always_response(&acl_request.id, "alice-app", 1),
        )
        .await;

    let response = client.recv_response().await;
    assert!(response.error.is_none(), "unexpected error: {response:?}");
    let signed: SignedEvent = serde_json::from_str(&response.result.unwrap()).unwrap();
    assert_eq!(signed.kind, 1);
    assert_eq!(signed.pubkey, harness.alice_pubkey);

    // The grant landed: KeyUser + scoped condition.
    let users = harness.bunker.store.list_key_users(Some("alice")).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_pubkey, client.pubkey().to_hex());
    assert_eq!(users[0].description.as_deref(), Some("alice-app"));
    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    assert!(conditions
        .iter()
        .any(|c| c.method == "sign_event" && c.scope == "1" && c.allowed));

    // Second request: no admin traffic, immediate signature.
    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;
    let response = client.recv_response().await;
    assert!(response.error.is_none());
    assert!(admin_app.try_recv().is_none(), "no fanout expected");

    // Scenario 3: out-of-scope kind fans out again.
    client
        .send_request(&harness.alice_pubkey, &sign_event_request(4))
        .await;
    let fanout = admin_app.recv().await;
    let acl_request: RpcRequest = serde_json::from_str(&fanout.payload).unwrap();
    assert_eq!(acl_request.method, "acl");

    // A bare affirmative is a one-shot approval with no ACL write.
    admin_app
        .send_response(
            &harness.bunker.admin.public_key(),
            &RpcResponse::ok(&acl_request.id, "\"yes\""),
        )
        .await;
    let response = client.recv_response().await;
    assert!(response.error.is_none());

    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    assert!(
        !conditions.iter().any(|c| c.scope == "4"),
        "one-shot approval must not persist a grant"
    );
}

// ── Admin timeout ────────────────────────────────────────────────────

#[tokio::test]
async fn fanout_without_response_times_out() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    let started = Instant::now();
    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;
    let response = client.recv_response().await;
    let elapsed = started.elapsed();

    let error = response.error.unwrap();
    assert!(error.starts_with("timed_out"), "got: {error}");
    // The approval window in the test harness is 500ms.
    assert!(elapsed >= Duration::from_millis(450), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "too slow: {elapsed:?}");
}

// ── Explicit deny ────────────────────────────────────────────────────

#[tokio::test]
async fn never_persists_a_hard_deny() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut admin_app =
        Peer::with_identity(&harness.transport, admin_identity, ADMIN_RPC_KIND).await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;
    let fanout = admin_app.recv().await;
    let acl_request: RpcRequest = serde_json::from_str(&fanout.payload).unwrap();
    admin_app
        .send_response(
            &harness.bunker.admin.public_key(),
            &RpcResponse::ok(&acl_request.id, "[\"never\"]"),
        )
        .await;

    let response = client.recv_response().await;
    assert!(response.error.unwrap().starts_with("denied"));

    // The hard deny now short-circuits every method without fanout.
    client
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new("ping", Vec::new()),
        )
        .await;
    let response = client.recv_response().await;
    assert!(response.error.unwrap().starts_with("denied"));
    assert!(admin_app.try_recv().is_none());
}

// ── Scenario 4: token redemption through the admin plane ─────────────

#[tokio::test]
async fn token_redemption_installs_policy_rules() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut admin_app =
        Peer::with_identity(&harness.transport, admin_identity, ADMIN_RPC_KIND).await;
    let bunker_admin = harness.bunker.admin.public_key();

    // create_new_policy
    let spec = serde_json::json!({
        "name": "social",
        "rules": [
            { "method": "sign_event", "kind": "1", "maxUsageCount": 10 },
            { "method": "encrypt" },
        ],
    });
    admin_app
        .send_request(
            &bunker_admin,
            &RpcRequest::new("create_new_policy", vec![spec.to_string()]),
        )
        .await;
    let response = admin_app.recv_response().await;
    let policy: Value = serde_json::from_str(&response.result.unwrap()).unwrap();
    let policy_id = policy["id"].as_i64().unwrap();

    // create_new_token
    admin_app
        .send_request(
            &bunker_admin,
            &RpcRequest::new(
                "create_new_token",
                vec![
                    "alice".to_owned(),
                    "mobile-app".to_owned(),
                    policy_id.to_string(),
                ],
            ),
        )
        .await;
    let response = admin_app.recv_response().await;
    let token: Value = serde_json::from_str(&response.result.unwrap()).unwrap();
    let token_str = token["token"].as_str().unwrap().to_owned();

    // The client connects presenting the token.
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;
    client
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new("connect", vec![String::new(), token_str.clone()]),
        )
        .await;
    let response = client.recv_response().await;
    assert!(response.error.is_none(), "connect failed: {response:?}");
    assert_eq!(response.result.as_deref(), Some("ack"));

    // Rules materialized: connect, sign_event(kind 1), encrypt.
    let users = harness.bunker.store.list_key_users(Some("alice")).await.unwrap();
    assert_eq!(users.len(), 1);
    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    let has = |m: &str, s: &str| conditions.iter().any(|c| c.method == m && c.scope == s);
    assert!(has("connect", ""));
    assert!(has("sign_event", "1"));
    assert!(has("encrypt", ""));

    // Redemption is one-shot.
    let mut second = Peer::new(&harness.transport, USER_RPC_KIND).await;
    second
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new("connect", vec![String::new(), token_str]),
        )
        .await;
    let response = second.recv_response().await;
    assert!(response.error.unwrap().starts_with("already_redeemed"));

    // Signing within the granted scope now works without approval.
    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;
    let response = client.recv_response().await;
    assert!(response.error.is_none());
}

// ── Scenario 6: reserved usernames ───────────────────────────────────

#[tokio::test]
async fn reserved_username_conflicts_without_side_effects() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        with_domain: true,
        ..BootSpec::default()
    })
    .await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new(
                "create_account",
                vec!["admin".to_owned(), "example.com".to_owned()],
            ),
        )
        .await;
    let response = client.recv_response().await;
    assert!(response.error.unwrap().starts_with("conflict"));

    // No ACL mutation, no identity-file mutation, no new key.
    assert!(harness
        .bunker
        .store
        .list_key_users(None)
        .await
        .unwrap()
        .is_empty());
    let config = harness.bunker.load_config().await.unwrap();
    assert!(config.keys.is_empty());
}

// ── Account creation happy path ──────────────────────────────────────

#[tokio::test]
async fn account_creation_grants_caller_full_rights() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        with_domain: true,
        ..BootSpec::default()
    })
    .await;
    let mut admin_app =
        Peer::with_identity(&harness.transport, admin_identity, ADMIN_RPC_KIND).await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new(
                "create_account",
                vec!["bob".to_owned(), "example.com".to_owned()],
            ),
        )
        .await;

    // Account creation is gated: approve one-shot.
    let fanout = admin_app.recv().await;
    let acl_request: RpcRequest = serde_json::from_str(&fanout.payload).unwrap();
    admin_app
        .send_response(
            &harness.bunker.admin.public_key(),
            &RpcResponse::ok(&acl_request.id, "\"yes\""),
        )
        .await;

    let response = client.recv_response().await;
    assert!(response.error.is_none(), "create_account failed: {response:?}");
    let new_pubkey: PublicKey = response.result.unwrap().parse().unwrap();

    // Key stored raw and unlocked.
    let config = harness.bunker.load_config().await.unwrap();
    let entry = config.keys.get("bob").expect("bob key stored");
    assert!(!entry.is_encrypted());
    assert_eq!(entry.pubkey, new_pubkey);
    assert!(harness.bunker.keyring.is_unlocked("bob").await);

    // Caller received the full method set on the new key.
    let users = harness.bunker.store.list_key_users(Some("bob")).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_pubkey, client.pubkey().to_hex());
    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    let methods: Vec<&str> = conditions.iter().map(|c| c.method.as_str()).collect();
    for method in ["connect", "sign_event", "encrypt", "decrypt"] {
        assert!(methods.contains(&method), "missing {method}");
    }

    // The profile was published for the new identity.
    assert!(harness
        .transport
        .published()
        .iter()
        .any(|e| e.pubkey == new_pubkey && e.kind == 0));

    // And the new key answers on the user plane within the granted scope.
    // (Give the dynamically spawned listener a moment to subscribe.)
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .send_request(&new_pubkey, &sign_event_request(1))
        .await;
    let response = client.recv_response().await;
    assert!(response.error.is_none(), "signing on new key failed: {response:?}");
    let signed: SignedEvent = serde_json::from_str(&response.result.unwrap()).unwrap();
    assert_eq!(signed.pubkey, new_pubkey);
}

// ── Admin plane admission ────────────────────────────────────────────

#[tokio::test]
async fn non_admin_senders_are_rejected() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut stranger = Peer::new(&harness.transport, ADMIN_RPC_KIND).await;

    stranger
        .send_request(
            &harness.bunker.admin.public_key(),
            &RpcRequest::new("get_keys", Vec::new()),
        )
        .await;
    let response = stranger.recv_response().await;
    assert!(response.error.unwrap().starts_with("unauthorized"));
}

#[tokio::test]
async fn unlock_key_via_admin_rpc() {
    let admin_identity = Identity::generate();
    let harness = boot(BootSpec {
        admins: vec![admin_identity.public_key()],
        ..BootSpec::default()
    })
    .await;
    let mut admin_app =
        Peer::with_identity(&harness.transport, admin_identity, ADMIN_RPC_KIND).await;
    let bunker_admin = harness.bunker.admin.public_key();

    // Store an encrypted entry out of band.
    let stored_identity = Identity::generate();
    let entry = bunker_core::keys::StoredKey::encrypted(&stored_identity, "hunter2").unwrap();
    harness
        .bunker
        .persist_config(|c| {
            c.keys.insert("carol".to_owned(), entry);
        })
        .await;

    // Wrong passphrase fails and leaves the key locked.
    admin_app
        .send_request(
            &bunker_admin,
            &RpcRequest::new(
                "unlock_key",
                vec!["carol".to_owned(), "wrong".to_owned()],
            ),
        )
        .await;
    let response = admin_app.recv_response().await;
    assert!(response.error.unwrap().starts_with("bad_passphrase"));
    assert!(!harness.bunker.keyring.is_unlocked("carol").await);

    // Correct passphrase unlocks.
    admin_app
        .send_request(
            &bunker_admin,
            &RpcRequest::new(
                "unlock_key",
                vec!["carol".to_owned(), "hunter2".to_owned()],
            ),
        )
        .await;
    let response = admin_app.recv_response().await;
    assert_eq!(response.result.as_deref(), Some("true"));
    assert!(harness.bunker.keyring.is_unlocked("carol").await);
}

// ── Scenario 5: web approval path ────────────────────────────────────

#[tokio::test]
async fn web_approval_resolves_the_suspended_request() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let harness = boot(BootSpec {
        base_url: Some("https://b.example".to_owned()),
        ..BootSpec::default()
    })
    .await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;

    // The out-of-band reply carries the approval URL without resolving the RPC.
    let oob = client.recv_response().await;
    assert_eq!(oob.result.as_deref(), Some("auth_url"));
    let url = oob.error.unwrap();
    assert!(url.starts_with("https://b.example/requests/"));
    let ledger_id = url.rsplit('/').next().unwrap().to_owned();

    // The row is visible through the web API.
    let app = bunker_daemon::web::router(Arc::clone(&harness.bunker));
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/requests/{ledger_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let row: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(row["method"], "sign_event");
    assert_eq!(row["keyName"], "alice");

    // Approve persistently through the web API.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/requests/{ledger_id}/approve"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"always": true, "description": "web"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The suspended RPC resolves with the signed event.
    let response = client.recv_response().await;
    assert!(response.error.is_none(), "unexpected error: {response:?}");
    let signed: SignedEvent = serde_json::from_str(&response.result.unwrap()).unwrap();
    assert_eq!(signed.kind, 1);

    // The grant was installed with the event's kind as scope.
    let users = harness.bunker.store.list_key_users(Some("alice")).await.unwrap();
    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    assert!(conditions
        .iter()
        .any(|c| c.method == "sign_event" && c.scope == "1" && c.allowed));
}

#[tokio::test]
async fn web_approval_of_connect_installs_signing_convenience() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let harness = boot(BootSpec {
        base_url: Some("https://b.example".to_owned()),
        ..BootSpec::default()
    })
    .await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(
            &harness.alice_pubkey,
            &RpcRequest::new("connect", Vec::new()),
        )
        .await;
    let oob = client.recv_response().await;
    let url = oob.error.unwrap();
    let ledger_id = url.rsplit('/').next().unwrap().to_owned();

    let app = bunker_daemon::web::router(Arc::clone(&harness.bunker));
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(format!("/requests/{ledger_id}/approve"))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"always": true}"#))
            .unwrap(),
    )
    .await
    .unwrap();

    let response = client.recv_response().await;
    assert_eq!(response.result.as_deref(), Some("ack"));

    let users = harness.bunker.store.list_key_users(Some("alice")).await.unwrap();
    let conditions = harness.bunker.store.list_conditions(users[0].id).await.unwrap();
    assert!(conditions.iter().any(|c| c.method == "connect"));
    assert!(conditions
        .iter()
        .any(|c| c.method == "sign_event" && c.scope == "all" && c.allowed));
}

#[tokio::test]
async fn web_denial_rejects_the_suspended_request() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let harness = boot(BootSpec {
        base_url: Some("https://b.example".to_owned()),
        ..BootSpec::default()
    })
    .await;
    let mut client = Peer::new(&harness.transport, USER_RPC_KIND).await;

    client
        .send_request(&harness.alice_pubkey, &sign_event_request(1))
        .await;
    let oob = client.recv_response().await;
    let ledger_id = oob.error.unwrap().rsplit('/').next().unwrap().to_owned();

    let app = bunker_daemon::web::router(Arc::clone(&harness.bunker));
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(format!("/requests/{ledger_id}/deny"))
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();

    let response = client.recv_response().await;
    assert!(response.error.unwrap().starts_with("denied"));
}

// ── Liveness plumbing ────────────────────────────────────────────────

#[tokio::test]
async fn self_ping_reaches_the_watchdog() {
    let mut harness = boot(BootSpec::default()).await;

    let ping = RpcRequest::new("ping", Vec::new());
    let payload = serde_json::to_string(&ping).unwrap();
    let self_pubkey = harness.bunker.admin.public_key();
    harness
        .transport
        .send(&harness.bunker.admin, &self_pubkey, ADMIN_RPC_KIND, &payload)
        .await
        .unwrap();

    tokio::time::timeout(RECV_TIMEOUT, harness.ping_rx.recv())
        .await
        .expect("self-ping was not observed")
        .expect("channel closed");
}
