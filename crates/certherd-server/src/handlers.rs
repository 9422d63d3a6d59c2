use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{error::BundleError, trust::TrustOutcome, AppState};

// ── Envelope helpers ─────────────────────────────────────────────────────────

/// Every response is `{status: 0, data}` on success or `{status: 1, msg}` on
/// a definitive failure. Domain failures keep HTTP 200; only the auth gate
/// and internal errors use non-200 codes.
fn success(data: serde_json::Value) -> Response {
    Json(json!({"status": 0, "data": data})).into_response()
}

fn failure(msg: &str) -> Response {
    Json(json!({"status": 1, "msg": msg})).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"status": 1, "msg": "internal server error"})),
    )
        .into_response()
}

// ── Version ──────────────────────────────────────────────────────────────────

pub async fn get_version(State(state): State<AppState>) -> Response {
    match state.bundle.current_version() {
        Ok(version) => success(json!({ "version": version })),
        Err(BundleError::NotFound) => failure("certificate not exist"),
        Err(e) => internal_error(e),
    }
}

// ── Bundle ───────────────────────────────────────────────────────────────────

pub async fn get_cert(State(state): State<AppState>) -> Response {
    match state.bundle.contents() {
        Ok(files) => {
            info!(files = files.len(), "audit: bundle.fetch");
            if let Some(notifier) = &state.notifier {
                let names: Vec<&String> = files.keys().collect();
                notifier.send("cert.fetched", "bundle served", json!({ "files": names }));
            }
            success(json!(files))
        }
        Err(BundleError::NotFound) => failure("certificate not exist"),
        Err(e) => internal_error(e),
    }
}

// ── Registration ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub user: String,
    pub ssh_port: u16,
    pub cert_dir: String,
    #[serde(default)]
    pub after_script: String,
}

pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<RegistrationRequest>,
) -> Response {
    process_registration(&state, peer.ip(), body).await
}

/// Upsert the caller's subscriber record, then pin or check its host
/// identity. A changed identity is reported but does not fail the
/// registration; the pin stays as it was and pushes stay blocked until the
/// mismatch is resolved.
pub async fn process_registration(
    state: &AppState,
    source: IpAddr,
    body: RegistrationRequest,
) -> Response {
    let address = source.to_string();

    let record = match state.store.upsert_subscriber(
        &address,
        &body.user,
        body.ssh_port,
        &body.cert_dir,
        &body.after_script,
    ) {
        Ok(record) => record,
        Err(e) => return internal_error(e),
    };
    info!(
        address = %record.address,
        principal = %record.principal,
        port = record.port,
        "audit: subscriber.register"
    );

    match state.trust.verify(&address, body.ssh_port).await {
        Ok(TrustOutcome::Established(entry)) => {
            info!(address = %address, fingerprint = %entry.fingerprint, "subscriber host identity pinned");
        }
        Ok(TrustOutcome::Verified) => {}
        Ok(TrustOutcome::Violation { known, presented }) => {
            warn!(
                address = %address,
                known = %known,
                presented = %presented,
                "registration flagged: host identity mismatch"
            );
            if let Some(notifier) = &state.notifier {
                notifier.send(
                    "trust.violation",
                    &address,
                    json!({ "known": known, "presented": presented, "during": "registration" }),
                );
            }
        }
        Err(e) => {
            // Scan trouble is not the subscriber's fault; the pin (if any)
            // will be checked again before the next push.
            warn!(address = %address, error = %e, "host identity scan failed during registration");
        }
    }

    success(json!({ "publickey": state.push_pubkey.as_str() }))
}
