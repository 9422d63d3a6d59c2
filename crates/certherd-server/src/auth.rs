//! Request gate: HMAC signature over the `Date` header plus an optional
//! source allow-list. The gate enforces exact-match signatures only; there
//! is no freshness window on the signed date.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use ipnet::IpNet;
use serde_json::json;
use sha2::Sha256;
use tracing::warn;
use zeroize::ZeroizeOnDrop;

use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// The process-wide shared secret, wiped from memory on drop. Loaded once
/// at startup and immutable for the process lifetime.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn new(key: String) -> Self {
        Self(key)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Hex HMAC-SHA256 of `message` under `key`. Shared by the request gate,
/// the pull client, and the notification sink.
pub fn signature(key: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// True iff `authorization` is the exact signature of `date` under `key`.
pub fn verify_signature(key: &str, date: &str, authorization: &str) -> bool {
    let expected = signature(key, date);
    constant_time_eq(authorization.as_bytes(), expected.as_bytes())
}

// ── Source allow-list ────────────────────────────────────────────────────────

/// Set of networks permitted to call the API. Entries are CIDR ranges or
/// bare addresses (treated as single-host networks).
#[derive(Debug, Clone)]
pub struct SourceAllowlist {
    nets: Vec<IpNet>,
}

impl SourceAllowlist {
    /// Parse a comma-separated list such as `"10.0.0.0/8, 192.0.2.7"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut nets = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Ok(net) = part.parse::<IpNet>() {
                nets.push(net);
            } else if let Ok(ip) = part.parse::<IpAddr>() {
                nets.push(IpNet::from(ip));
            } else {
                return Err(format!("invalid allow-list entry: {part}"));
            }
        }
        if nets.is_empty() {
            return Err("allow-list is empty".to_string());
        }
        Ok(Self { nets })
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Axum middleware guarding every API route.
///
/// Order matters: a configured allow-list rejects unknown or unlisted
/// sources before any signature work, then `Authorization` must equal
/// `HMAC(access_key, Date)`. Denials are logged with source and reason;
/// nothing is mutated on either outcome.
pub async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());

    if let Some(allowlist) = &state.allowlist {
        match peer {
            Some(ip) if allowlist.permits(ip) => {}
            _ => {
                warn!(source = ?peer, "rejected request: source not in allow-list");
                return deny(StatusCode::FORBIDDEN, "forbidden");
            }
        }
    }

    let date = header_str(&request, "Date");
    let authorization = header_str(&request, "Authorization");

    match (date, authorization) {
        (Some(date), Some(authorization)) => {
            if verify_signature(state.access_key.expose(), date, authorization) {
                next.run(request).await
            } else {
                warn!(source = ?peer, "rejected request: signature mismatch");
                deny(StatusCode::UNAUTHORIZED, "unauthorized")
            }
        }
        _ => {
            warn!(source = ?peer, "rejected request: missing Date or Authorization header");
            deny(StatusCode::UNAUTHORIZED, "unauthorized")
        }
    }
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

fn deny(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({"status": 1, "msg": msg}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = signature("key", "Mon, 03 Aug 2026 10:00:00 GMT");
        let b = signature("key", "Mon, 03 Aug 2026 10:00:00 GMT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_depends_on_key_and_date() {
        let base = signature("key", "date");
        assert_ne!(base, signature("other-key", "date"));
        assert_ne!(base, signature("key", "other-date"));
    }

    #[test]
    fn verify_accepts_only_the_exact_pair() {
        let date = "Mon, 03 Aug 2026 10:00:00 GMT";
        let sig = signature("key", date);
        assert!(verify_signature("key", date, &sig));

        // Flipping one byte of the date breaks verification.
        let mut tampered_date = date.to_string();
        tampered_date.replace_range(0..1, "T");
        assert!(!verify_signature("key", &tampered_date, &sig));

        // Flipping one byte of the signature breaks verification.
        let mut tampered_sig = sig.clone();
        let flipped = if &tampered_sig[0..1] == "0" { "1" } else { "0" };
        tampered_sig.replace_range(0..1, flipped);
        assert!(!verify_signature("key", date, &tampered_sig));
    }

    #[test]
    fn allowlist_accepts_cidrs_and_bare_addresses() {
        let list = SourceAllowlist::parse("10.0.0.0/8, 192.0.2.7").unwrap();
        assert!(list.permits("10.1.2.3".parse().unwrap()));
        assert!(list.permits("192.0.2.7".parse().unwrap()));
        assert!(!list.permits("192.0.2.8".parse().unwrap()));
        assert!(!list.permits("203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn allowlist_rejects_garbage_and_empty_entries() {
        assert!(SourceAllowlist::parse("not-an-ip").is_err());
        assert!(SourceAllowlist::parse("").is_err());
        assert!(SourceAllowlist::parse(" , ").is_err());
    }
}
