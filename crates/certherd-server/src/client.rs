//! Subscriber-side pull client: fetch the version or the bundle over the
//! authenticated API, and register this node for pushes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::auth::signature;
use crate::bundle::BUNDLE_FILES;
use crate::handlers::RegistrationRequest;

/// `Date` and `Authorization` header values for one request.
pub fn auth_headers(access_key: &str) -> (String, String) {
    let date = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
    let authorization = signature(access_key, &date);
    (date, authorization)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    msg: Option<String>,
}

pub struct PullClient {
    base: String,
    access_key: String,
    client: reqwest::Client,
}

impl PullClient {
    /// `base` is the server origin, e.g. `http://cert.example.org:8000`.
    pub fn new(base: &str, access_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("build pull reqwest client");

        Self {
            base: base.trim_end_matches('/').to_owned(),
            access_key: access_key.to_owned(),
            client,
        }
    }

    pub async fn fetch_version(&self) -> Result<String> {
        let data = self.get("/get_version").await?;
        data.get("version")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .context("response carried no version")
    }

    /// Download the bundle into `dest`, writing only recognized file names.
    /// Returns the names written. `privkey.pem` is written 0600 on unix.
    pub async fn fetch_bundle(&self, dest: &Path) -> Result<Vec<String>> {
        let data = self.get("/get_cert").await?;
        let files: BTreeMap<String, String> =
            serde_json::from_value(data).context("malformed bundle response")?;

        std::fs::create_dir_all(dest)
            .with_context(|| format!("create {}", dest.display()))?;

        let mut written = Vec::new();
        for (name, contents) in files {
            if !BUNDLE_FILES.contains(&name.as_str()) {
                continue;
            }
            let path = dest.join(&name);
            std::fs::write(&path, contents)
                .with_context(|| format!("write {}", path.display()))?;
            #[cfg(unix)]
            if name == "privkey.pem" {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                    .with_context(|| format!("chmod {}", path.display()))?;
            }
            written.push(name);
        }
        Ok(written)
    }

    /// Register this node for pushes. Returns the server's push public key,
    /// to be added to the push principal's authorized keys.
    pub async fn register(&self, request: &RegistrationRequest) -> Result<String> {
        let (date, authorization) = auth_headers(&self.access_key);
        let response = self
            .client
            .post(format!("{}/registration", self.base))
            .header("Date", date)
            .header("Authorization", authorization)
            .json(request)
            .send()
            .await
            .context("registration request failed")?;

        let envelope: Envelope = response
            .json()
            .await
            .context("malformed registration response")?;
        let data = unwrap_envelope(envelope)?;
        data.get("publickey")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .context("response carried no publickey")
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let (date, authorization) = auth_headers(&self.access_key);
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .header("Date", date)
            .header("Authorization", authorization)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;

        let envelope: Envelope = response
            .json()
            .await
            .with_context(|| format!("malformed response from {path}"))?;
        unwrap_envelope(envelope)
    }
}

fn unwrap_envelope(envelope: Envelope) -> Result<serde_json::Value> {
    if envelope.status == 0 {
        envelope.data.context("success response carried no data")
    } else {
        bail!(
            "server rejected the request: {}",
            envelope.msg.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}
