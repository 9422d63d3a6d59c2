use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A node registered to receive certificate pushes, keyed by its network
/// address. All fields except `address` are overwritten on re-registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub address: String,
    /// Remote account used for the push channel.
    pub principal: String,
    pub port: u16,
    /// Remote directory receiving the bundle files.
    pub install_dir: String,
    /// Shell command run on the subscriber after a transfer.
    pub post_install_command: String,
    /// Unix seconds of the last successful registration call.
    pub last_seen: i64,
}

impl Subscriber {
    /// True once the subscriber has gone unseen for longer than `ttl_seconds`.
    pub fn is_stale(&self, ttl_seconds: i64, now: i64) -> bool {
        now - self.last_seen > ttl_seconds
    }

    /// `principal@address` target string for the push channel.
    pub fn target(&self) -> String {
        format!("{}@{}", self.principal, self.address)
    }
}

/// Pinned host identity for a subscriber endpoint, recorded on first
/// contact. A later mismatch is a trust violation and never overwrites
/// this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedHost {
    pub address: String,
    /// Key type plus base64 key material as presented by the endpoint.
    pub host_key: String,
    /// Lowercase hex SHA-256 of `host_key`.
    pub fingerprint: String,
    pub first_seen: i64,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
