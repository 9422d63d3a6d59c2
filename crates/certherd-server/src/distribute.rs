//! Push distribution: fan the current bundle out to every live subscriber.
//!
//! Each subscriber is an independent unit of work. A pass first evicts
//! stale registrations, then snapshots the registry, then pushes to each
//! subscriber with bounded concurrency. One subscriber's failure never
//! aborts the pass; a partially updated subscriber is retried in full on
//! the next pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::bundle::CertBundle;
use crate::command::CommandRunner;
use crate::error::Error;
use crate::notify::Notifier;
use crate::store::{Store, Subscriber};
use crate::trust::{TrustBootstrap, TrustOutcome};

pub struct DistributionConfig {
    /// Registrations older than this are evicted before a pass.
    pub subscriber_ttl: Duration,
    /// Upper bound on concurrent subscriber pushes.
    pub parallelism: usize,
    /// Timeout applied to each remote operation.
    pub remote_timeout: Duration,
    /// Private key handed to the transfer channel, when not the default.
    pub identity_file: Option<PathBuf>,
}

/// What happened to each subscriber in one pass.
#[derive(Debug, Default)]
pub struct DistributionReport {
    pub evicted: Vec<String>,
    pub pushed: Vec<String>,
    pub skipped_trust: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct DistributionEngine {
    store: Store,
    bundle: CertBundle,
    trust: TrustBootstrap,
    runner: Arc<dyn CommandRunner>,
    notifier: Option<Notifier>,
    cfg: Arc<DistributionConfig>,
}

impl DistributionEngine {
    pub fn new(
        store: Store,
        bundle: CertBundle,
        trust: TrustBootstrap,
        runner: Arc<dyn CommandRunner>,
        notifier: Option<Notifier>,
        cfg: DistributionConfig,
    ) -> Self {
        Self {
            store,
            bundle,
            trust,
            runner,
            notifier,
            cfg: Arc::new(cfg),
        }
    }

    /// Run one distribution pass over the current registry snapshot.
    pub async fn distribute(&self) -> Result<DistributionReport, Error> {
        let mut report = DistributionReport {
            evicted: self
                .store
                .evict_stale(self.cfg.subscriber_ttl.as_secs() as i64)?,
            ..Default::default()
        };
        for address in &report.evicted {
            info!(address = %address, "evicted stale subscriber");
        }

        let subscribers = self.store.list_subscribers()?;
        let files = self.bundle.file_paths()?;
        let version = self.bundle.current_version()?;
        info!(
            subscribers = subscribers.len(),
            files = files.len(),
            version = %version,
            "starting distribution pass"
        );

        let semaphore = Arc::new(Semaphore::new(self.cfg.parallelism.max(1)));
        let mut tasks = JoinSet::new();
        for subscriber in subscribers {
            let engine = self.clone();
            let files = files.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let outcome = engine.push_one(&subscriber, &files).await;
                (subscriber.address, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (address, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "push task aborted");
                    continue;
                }
            };
            match outcome {
                Ok(()) => {
                    info!(address = %address, "bundle pushed");
                    self.notify("cert.pushed", &address, json!({ "version": version.clone() }));
                    report.pushed.push(address);
                }
                Err(Error::TrustViolation {
                    known, presented, ..
                }) => {
                    warn!(address = %address, "transfer skipped: host identity mismatch");
                    self.notify(
                        "trust.violation",
                        &address,
                        json!({ "known": known, "presented": presented }),
                    );
                    report.skipped_trust.push(address);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "push failed");
                    self.notify("cert.push_failed", &address, json!({ "error": e.to_string() }));
                    report.failed.push((address, e.to_string()));
                }
            }
        }

        info!(
            pushed = report.pushed.len(),
            failed = report.failed.len(),
            skipped_trust = report.skipped_trust.len(),
            "distribution pass finished"
        );
        Ok(report)
    }

    /// Trust check, transfer, then post-install for a single subscriber.
    async fn push_one(&self, subscriber: &Subscriber, files: &[PathBuf]) -> Result<(), Error> {
        match self.trust.verify(&subscriber.address, subscriber.port).await? {
            TrustOutcome::Violation { known, presented } => {
                return Err(Error::TrustViolation {
                    address: subscriber.address.clone(),
                    known,
                    presented,
                });
            }
            TrustOutcome::Established(_) | TrustOutcome::Verified => {}
        }

        let mut args = vec![
            "-P".to_string(),
            subscriber.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.cfg.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        for file in files {
            args.push(file.display().to_string());
        }
        args.push(format!("{}:{}", subscriber.target(), subscriber.install_dir));

        let transfer = self
            .runner
            .run("scp", &args, self.cfg.remote_timeout)
            .await
            .map_err(|e| Error::Transfer {
                address: subscriber.address.clone(),
                detail: e.to_string(),
            })?;
        if !transfer.success {
            return Err(Error::Transfer {
                address: subscriber.address.clone(),
                detail: transfer.output,
            });
        }

        if subscriber.post_install_command.trim().is_empty() {
            return Ok(());
        }

        let mut args = vec![
            "-p".to_string(),
            subscriber.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(identity) = &self.cfg.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(subscriber.target());
        args.push(subscriber.post_install_command.clone());

        let exec = self
            .runner
            .run("ssh", &args, self.cfg.remote_timeout)
            .await
            .map_err(|e| Error::RemoteExec {
                address: subscriber.address.clone(),
                detail: e.to_string(),
            })?;
        if !exec.success {
            return Err(Error::RemoteExec {
                address: subscriber.address.clone(),
                detail: exec.output,
            });
        }

        Ok(())
    }

    fn notify(&self, event: &str, subject: &str, detail: serde_json::Value) {
        if let Some(notifier) = &self.notifier {
            notifier.send(event, subject, detail);
        }
    }
}
