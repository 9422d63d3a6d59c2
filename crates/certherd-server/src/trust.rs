//! First-contact pinning of subscriber host identities.
//!
//! The identity presented by an endpoint's SSH port is recorded the first
//! time the server talks to an address. Any later contact presenting a
//! different identity is a trust violation: it is reported, the pin is left
//! untouched, and a distribution pass refuses to transfer to that address.

use std::sync::Arc;
use std::time::Duration;

use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::error::Error;
use crate::store::{Store, TrustedHost};

/// Key type requested from the endpoint. Pinning a single type keeps the
/// presented identity stable across scans.
const KEYSCAN_KEY_TYPE: &str = "ed25519";

#[derive(Debug, Clone, PartialEq)]
pub enum TrustOutcome {
    /// First contact; the presented identity is now pinned.
    Established(TrustedHost),
    /// The presented identity matches the pin.
    Verified,
    /// The presented identity differs from the pin. The pin is unchanged.
    Violation { known: String, presented: String },
}

#[derive(Clone)]
pub struct TrustBootstrap {
    store: Store,
    runner: Arc<dyn CommandRunner>,
    scan_timeout: Duration,
}

impl TrustBootstrap {
    pub fn new(store: Store, runner: Arc<dyn CommandRunner>, scan_timeout: Duration) -> Self {
        Self {
            store,
            runner,
            scan_timeout,
        }
    }

    /// Scan the host identity currently presented by `address:port` and
    /// check it against the pinned entry, recording it on first contact.
    pub async fn verify(&self, address: &str, port: u16) -> Result<TrustOutcome, Error> {
        let args = vec![
            "-t".to_string(),
            KEYSCAN_KEY_TYPE.to_string(),
            "-p".to_string(),
            port.to_string(),
            "-T".to_string(),
            self.scan_timeout.as_secs().max(1).to_string(),
            address.to_string(),
        ];
        let scan = self
            .runner
            .run("ssh-keyscan", &args, self.scan_timeout)
            .await?;
        if !scan.success {
            return Err(Error::HostScanFailed {
                address: address.to_owned(),
                detail: scan.output,
            });
        }

        let host_key = parse_keyscan_output(&scan.output).ok_or_else(|| Error::HostScanFailed {
            address: address.to_owned(),
            detail: "scan returned no host key".to_string(),
        })?;
        let fingerprint = hex::encode(Sha256::digest(host_key.as_bytes()));

        match self.store.trusted_host(address)? {
            None => {
                let entry = TrustedHost {
                    address: address.to_owned(),
                    host_key,
                    fingerprint,
                    first_seen: crate::store::model::unix_now(),
                };
                self.store.record_trusted_host(&entry)?;
                info!(address, fingerprint = %entry.fingerprint, "pinned host identity on first contact");
                Ok(TrustOutcome::Established(entry))
            }
            Some(known) => {
                if constant_time_eq(known.fingerprint.as_bytes(), fingerprint.as_bytes()) {
                    return Ok(TrustOutcome::Verified);
                }
                warn!(
                    address,
                    known = %known.fingerprint,
                    presented = %fingerprint,
                    "host identity changed; pin left untouched"
                );
                Ok(TrustOutcome::Violation {
                    known: known.fingerprint,
                    presented: fingerprint,
                })
            }
        }
    }
}

/// First non-comment scan line, with the leading host field stripped:
/// `"host ssh-ed25519 AAAA..."` becomes `"ssh-ed25519 AAAA..."`.
fn parse_keyscan_output(raw: &str) -> Option<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let _host = parts.next()?;
            let key_type = parts.next()?;
            let key = parts.next()?;
            Some(format!("{key_type} {key}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::{MockOutcome, MockRunner};
    use crate::store::db::testing::temp_store;

    const SCAN_A: &str = "# 192.0.2.1:22 SSH-2.0-OpenSSH_9.6\n192.0.2.1 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFirst";
    const SCAN_B: &str = "192.0.2.1 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAISecond";

    fn bootstrap(name: &str, mock: Arc<MockRunner>) -> TrustBootstrap {
        TrustBootstrap::new(temp_store(name), mock, Duration::from_secs(5))
    }

    #[test]
    fn keyscan_output_parses_past_comments() {
        let key = parse_keyscan_output(SCAN_A).unwrap();
        assert_eq!(key, "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFirst");
        assert!(parse_keyscan_output("# only comments\n").is_none());
        assert!(parse_keyscan_output("").is_none());
    }

    #[tokio::test]
    async fn first_contact_pins_the_identity() {
        let mock = Arc::new(MockRunner::new());
        mock.on(
            "ssh-keyscan",
            None,
            MockOutcome::Exit {
                success: true,
                output: SCAN_A.to_string(),
            },
        );
        let trust = bootstrap("first-contact", mock);

        let outcome = trust.verify("192.0.2.1", 22).await.unwrap();
        match outcome {
            TrustOutcome::Established(entry) => {
                assert_eq!(entry.address, "192.0.2.1");
                assert_eq!(entry.host_key, "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFirst");
            }
            other => panic!("expected Established, got {other:?}"),
        }

        // Second scan with the same key verifies against the pin.
        let outcome = trust.verify("192.0.2.1", 22).await.unwrap();
        assert_eq!(outcome, TrustOutcome::Verified);
    }

    #[tokio::test]
    async fn changed_identity_is_a_violation_and_pin_survives() {
        let mock = Arc::new(MockRunner::new());
        mock.on(
            "ssh-keyscan",
            None,
            MockOutcome::Exit {
                success: true,
                output: SCAN_A.to_string(),
            },
        );
        let trust = bootstrap("violation", Arc::clone(&mock));
        trust.verify("192.0.2.1", 22).await.unwrap();
        let pinned = trust.store.trusted_host("192.0.2.1").unwrap().unwrap();

        // The endpoint now presents a different key.
        let mock2 = Arc::new(MockRunner::new());
        mock2.on(
            "ssh-keyscan",
            None,
            MockOutcome::Exit {
                success: true,
                output: SCAN_B.to_string(),
            },
        );
        let trust = TrustBootstrap::new(trust.store.clone(), mock2, Duration::from_secs(5));

        let outcome = trust.verify("192.0.2.1", 22).await.unwrap();
        match outcome {
            TrustOutcome::Violation { known, presented } => {
                assert_eq!(known, pinned.fingerprint);
                assert_ne!(known, presented);
            }
            other => panic!("expected Violation, got {other:?}"),
        }

        // The stored pin is untouched.
        let after = trust.store.trusted_host("192.0.2.1").unwrap().unwrap();
        assert_eq!(after, pinned);
    }

    #[tokio::test]
    async fn failed_scan_is_a_host_scan_error() {
        let mock = Arc::new(MockRunner::new());
        mock.on(
            "ssh-keyscan",
            None,
            MockOutcome::Exit {
                success: false,
                output: "connection refused".to_string(),
            },
        );
        let trust = bootstrap("scan-failure", mock);

        let err = trust.verify("192.0.2.9", 22).await.unwrap_err();
        assert!(matches!(err, Error::HostScanFailed { .. }));
    }
}
