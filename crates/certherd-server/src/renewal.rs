//! Periodic renewal driver.
//!
//! One cycle reads the certificate expiry, invokes the external renewal
//! tool when the threshold is crossed, and then always redistributes the
//! on-disk bundle. Redistribution is unconditional because the bundle may
//! have been replaced out of band between cycles. A cycle never overlaps
//! with itself; an overlapping fire is dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::bundle::CertBundle;
use crate::command::CommandRunner;
use crate::distribute::{DistributionEngine, DistributionReport};
use crate::error::{BundleError, Error};
use crate::notify::Notifier;

/// Upper bound on one renewal tool invocation.
const RENEW_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug)]
pub enum CycleOutcome {
    /// A cycle was already running; this fire was dropped.
    AlreadyRenewing,
    /// No certificate has been issued yet; the tool was not invoked.
    NoCertificate,
    /// The expiry could not be read; the tool was not invoked.
    Unreadable { detail: String },
    /// The certificate is fresh enough; nothing was done.
    Skipped { days_left: i64 },
    /// The tool ran (successfully or not) and the bundle was redistributed.
    Renewed {
        tool_success: bool,
        report: DistributionReport,
    },
}

pub struct RenewalScheduler {
    bundle: CertBundle,
    engine: DistributionEngine,
    runner: Arc<dyn CommandRunner>,
    notifier: Option<Notifier>,
    renew_command: String,
    threshold_days: i64,
    renewing: AtomicBool,
}

impl RenewalScheduler {
    pub fn new(
        bundle: CertBundle,
        engine: DistributionEngine,
        runner: Arc<dyn CommandRunner>,
        notifier: Option<Notifier>,
        renew_command: String,
        threshold_days: i64,
    ) -> Self {
        Self {
            bundle,
            engine,
            runner,
            notifier,
            renew_command,
            threshold_days,
            renewing: AtomicBool::new(false),
        }
    }

    /// Start the periodic driver.
    pub fn spawn(self: Arc<Self>, period: Duration) {
        let scheduler = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup does not
            // race the server coming up.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scheduler.run_cycle().await;
            }
        });
    }

    /// Run one cycle unless one is already in flight. Also the manual
    /// trigger entry point.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .renewing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("renewal already in progress, dropping overlapping fire");
            return CycleOutcome::AlreadyRenewing;
        }

        let outcome = self.cycle_inner().await;
        self.renewing.store(false, Ordering::SeqCst);
        outcome
    }

    async fn cycle_inner(&self) -> CycleOutcome {
        let days_left = match self.bundle.days_until_expiry() {
            Ok(days) => days,
            Err(BundleError::NotFound) => {
                warn!("renewal check found no certificate");
                self.notify("renewal.failed", "certificate not exist", json!({}));
                return CycleOutcome::NoCertificate;
            }
            Err(e) => {
                error!(error = %e, "could not read certificate expiry");
                self.notify("renewal.failed", "expiry unreadable", json!({ "error": e.to_string() }));
                return CycleOutcome::Unreadable {
                    detail: e.to_string(),
                };
            }
        };

        if days_left > self.threshold_days {
            info!(days_left, "certificate is fresh, renewal skipped");
            return CycleOutcome::Skipped { days_left };
        }

        info!(days_left, command = %self.renew_command, "invoking renewal tool");
        let (tool_success, tool_output) = match self.run_renewal_tool().await {
            Ok(output) => {
                info!(output = %output, "renewal tool finished");
                (true, output)
            }
            Err(e) => {
                error!(error = %e, "renewal tool failed");
                self.notify(
                    "renewal.tool_failed",
                    &self.renew_command,
                    json!({ "error": e.to_string() }),
                );
                (false, e.to_string())
            }
        };

        // Redistribute whatever is on disk, even after a tool failure: the
        // bundle may still have changed underneath us.
        let report = match self.engine.distribute().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "distribution failed after renewal");
                self.notify("distribution.failed", "renewal cycle", json!({ "error": e.to_string() }));
                DistributionReport::default()
            }
        };

        self.notify(
            "renewal.completed",
            &self.renew_command,
            json!({
                "tool_success": tool_success,
                "tool_output": tool_output,
                "pushed": report.pushed.clone(),
                "failed": report.failed.clone(),
            }),
        );

        CycleOutcome::Renewed {
            tool_success,
            report,
        }
    }

    /// Invoke the external renewal command. Spawn trouble, a timeout, and a
    /// non-zero exit all surface as `ExternalTool`.
    async fn run_renewal_tool(&self) -> Result<String, Error> {
        let args = vec!["-c".to_string(), self.renew_command.clone()];
        let out = self
            .runner
            .run("sh", &args, RENEW_TOOL_TIMEOUT)
            .await
            .map_err(|e| Error::ExternalTool {
                detail: e.to_string(),
            })?;
        if !out.success {
            return Err(Error::ExternalTool { detail: out.output });
        }
        Ok(out.output)
    }

    fn notify(&self, event: &str, subject: &str, detail: serde_json::Value) {
        if let Some(notifier) = &self.notifier {
            notifier.send(event, subject, detail);
        }
    }
}
