//! Best-effort operator notification. Events are POSTed to a configured
//! endpoint and dropped on failure; delivery never influences control flow.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::signature;
use crate::store::model::unix_now;

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: String,
    pub subject: String,
    pub timestamp: i64,
    pub detail: serde_json::Value,
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: Arc<String>,
    /// Optional signing secret; when set, the body is signed so receivers
    /// can authenticate events.
    secret: Option<Arc<String>>,
}

impl Notifier {
    pub fn new(url: String, secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("build notify reqwest client");

        Self {
            client,
            url: Arc::new(url),
            secret: secret.map(Arc::new),
        }
    }

    /// Queue one event for delivery and return immediately.
    pub fn send(&self, event: &str, subject: &str, detail: serde_json::Value) {
        let notification = Notification {
            event: event.to_owned(),
            subject: subject.to_owned(),
            timestamp: unix_now(),
            detail,
        };

        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.deliver(&notification).await;
        });
    }

    async fn deliver(&self, notification: &Notification) {
        let body = match serde_json::to_string(notification) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize notification");
                return;
            }
        };

        let mut request = self
            .client
            .post(self.url.as_str())
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            let sig = signature(secret, &body);
            request = request.header("X-Certherd-Signature", format!("sha256={sig}"));
        }

        match request.body(body).send().await {
            Ok(resp) => {
                debug!(url = %self.url, status = %resp.status(), "notification delivered");
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "notification delivery failed");
            }
        }
    }
}
