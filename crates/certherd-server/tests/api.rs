use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_test::{TestResponse, TestServer};
use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use certherd_server::auth::{AccessKey, SourceAllowlist};
use certherd_server::bundle::CertBundle;
use certherd_server::client::auth_headers;
use certherd_server::command::{CommandRunner, ShellRunner};
use certherd_server::router;
use certherd_server::store::Store;
use certherd_server::trust::TrustBootstrap;
use certherd_server::AppState;

const ACCESS_KEY: &str = "integration-test-key";
const PUSH_PUBKEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIServer push@certherd";

fn make_state(name: &str, allowlist: Option<SourceAllowlist>) -> (AppState, PathBuf) {
    let root = std::env::temp_dir().join(format!("certherd-test-api-{name}"));
    let _ = std::fs::remove_dir_all(&root);
    let cert_dir = root.join("certs");
    std::fs::create_dir_all(&cert_dir).unwrap();

    let store = Store::open(&root.join("registry.db")).unwrap();
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let trust = TrustBootstrap::new(store.clone(), runner, Duration::from_secs(1));

    let state = AppState {
        store,
        access_key: AccessKey::new(ACCESS_KEY.to_string()),
        allowlist: allowlist.map(Arc::new),
        bundle: CertBundle::new(cert_dir.clone()),
        notifier: None,
        trust,
        push_pubkey: Arc::new(PUSH_PUBKEY.to_string()),
    };
    (state, cert_dir)
}

fn header(name: &'static str, value: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(name),
        HeaderValue::from_str(value).unwrap(),
    )
}

async fn signed_get(server: &TestServer, path: &str) -> TestResponse {
    let (date, authorization) = auth_headers(ACCESS_KEY);
    let (dn, dv) = header("date", &date);
    let (an, av) = header("authorization", &authorization);
    server.get(path).add_header(dn, dv).add_header(an, av).await
}

// ── Auth gate ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_headers_are_unauthorized() {
    let (state, _) = make_state("no-headers", None);
    let server = TestServer::new(router(state)).unwrap();

    let res = server.get("/get_version").await;
    assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json();
    assert_eq!(body["status"], 1);
}

#[tokio::test]
async fn tampering_with_either_header_is_rejected() {
    let (state, cert_dir) = make_state("tamper", None);
    std::fs::write(cert_dir.join("fullchain.pem"), "chain").unwrap();
    let server = TestServer::new(router(state)).unwrap();

    let (date, authorization) = auth_headers(ACCESS_KEY);

    // Untampered pair passes.
    let (dn, dv) = header("date", &date);
    let (an, av) = header("authorization", &authorization);
    let res = server.get("/get_version").add_header(dn, dv).add_header(an, av).await;
    assert_eq!(res.status_code(), StatusCode::OK);

    // One flipped byte in the date.
    let mut bad_date = date.clone().into_bytes();
    bad_date[0] ^= 1;
    let bad_date = String::from_utf8(bad_date).unwrap();
    let (dn, dv) = header("date", &bad_date);
    let (an, av) = header("authorization", &authorization);
    let res = server.get("/get_version").add_header(dn, dv).add_header(an, av).await;
    assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);

    // One flipped hex digit in the signature.
    let mut bad_sig = authorization.clone().into_bytes();
    bad_sig[0] = if bad_sig[0] == b'0' { b'1' } else { b'0' };
    let bad_sig = String::from_utf8(bad_sig).unwrap();
    let (dn, dv) = header("date", &date);
    let (an, av) = header("authorization", &bad_sig);
    let res = server.get("/get_version").add_header(dn, dv).add_header(an, av).await;
    assert_eq!(res.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn allowlist_rejects_sources_outside_it() {
    let (state, _) = make_state(
        "allowlist-deny",
        Some(SourceAllowlist::parse("203.0.113.0/24").unwrap()),
    );
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server = TestServer::builder().http_transport().build(app).unwrap();

    let res = signed_get(&server, "/get_version").await;
    assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn allowlist_admits_loopback_when_listed() {
    let (state, _) = make_state(
        "allowlist-admit",
        Some(SourceAllowlist::parse("127.0.0.0/8, ::1").unwrap()),
    );
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server = TestServer::builder().http_transport().build(app).unwrap();

    let res = signed_get(&server, "/get_version").await;
    assert_eq!(res.status_code(), StatusCode::OK);
}

// ── Version ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn absent_bundle_reports_certificate_not_exist() {
    let (state, _) = make_state("no-bundle", None);
    let server = TestServer::new(router(state)).unwrap();

    let res = signed_get(&server, "/get_version").await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: Value = res.json();
    assert_eq!(body["status"], 1);
    assert_eq!(body["msg"], "certificate not exist");
}

#[tokio::test]
async fn version_token_tracks_the_canonical_bytes() {
    let (state, cert_dir) = make_state("version", None);
    std::fs::write(cert_dir.join("fullchain.pem"), b"cert A").unwrap();
    let server = TestServer::new(router(state)).unwrap();

    let body: Value = signed_get(&server, "/get_version").await.json();
    assert_eq!(body["status"], 0);
    let expected = hex::encode(Sha256::digest(b"cert A"));
    assert_eq!(body["data"]["version"], Value::String(expected.clone()));

    // Stable across calls with no change.
    let again: Value = signed_get(&server, "/get_version").await.json();
    assert_eq!(again["data"]["version"], Value::String(expected));

    // Changes when the canonical bytes change.
    std::fs::write(cert_dir.join("fullchain.pem"), b"cert B").unwrap();
    let changed: Value = signed_get(&server, "/get_version").await.json();
    assert_ne!(changed["data"]["version"], body["data"]["version"]);
}

// ── Bundle fetch ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_cert_serves_only_recognized_files() {
    let (state, cert_dir) = make_state("get-cert", None);
    std::fs::write(cert_dir.join("fullchain.pem"), "chain contents").unwrap();
    std::fs::write(cert_dir.join("privkey.pem"), "key contents").unwrap();
    std::fs::write(cert_dir.join("renewal.conf"), "tool internals").unwrap();
    let server = TestServer::new(router(state)).unwrap();

    let body: Value = signed_get(&server, "/get_cert").await.json();
    assert_eq!(body["status"], 0);
    let data = body["data"].as_object().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data["fullchain.pem"], "chain contents");
    assert_eq!(data["privkey.pem"], "key contents");
    assert!(!data.contains_key("renewal.conf"));
}

// ── Registration ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn registration_upserts_one_record_per_source() {
    let (state, _) = make_state("registration", None);
    let store = state.store.clone();
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server = TestServer::builder().http_transport().build(app).unwrap();

    let (date, authorization) = auth_headers(ACCESS_KEY);
    let (dn, dv) = header("date", &date);
    let (an, av) = header("authorization", &authorization);
    let res = server
        .post("/registration")
        .add_header(dn, dv)
        .add_header(an, av)
        .json(&json!({
            "user": "deploy",
            "ssh_port": 22,
            "cert_dir": "/etc/ssl/fleet",
            "after_script": "systemctl reload nginx"
        }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);
    let body: Value = res.json();
    assert_eq!(body["status"], 0);
    assert_eq!(body["data"]["publickey"], PUSH_PUBKEY);

    let subscribers = store.list_subscribers().unwrap();
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].principal, "deploy");
    assert_eq!(subscribers[0].port, 22);

    // Re-registering from the same source overwrites, never duplicates.
    let (date, authorization) = auth_headers(ACCESS_KEY);
    let (dn, dv) = header("date", &date);
    let (an, av) = header("authorization", &authorization);
    let res = server
        .post("/registration")
        .add_header(dn, dv)
        .add_header(an, av)
        .json(&json!({
            "user": "deploy",
            "ssh_port": 2222,
            "cert_dir": "/etc/ssl/fleet",
            "after_script": ""
        }))
        .await;
    assert_eq!(res.status_code(), StatusCode::OK);

    let subscribers = store.list_subscribers().unwrap();
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].port, 2222);
    assert_eq!(subscribers[0].post_install_command, "");
}
