use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by bundle reads.
///
/// `NotFound` is a normal condition (no certificate issued yet) and maps to
/// the `certificate not exist` API envelope.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("certificate not exist")]
    NotFound,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse certificate: {0}")]
    Parse(String),
}

/// Distribution-domain errors. None of these terminate the process; the
/// scheduler and the API keep running after any single failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("certificate not exist")]
    CertificateNotFound,
    /// Bundle present but unreadable (I/O or parse trouble).
    #[error(transparent)]
    Bundle(BundleError),
    #[error("host identity for {address} changed: pinned {known}, presented {presented}")]
    TrustViolation {
        address: String,
        known: String,
        presented: String,
    },
    #[error("host identity scan failed for {address}: {detail}")]
    HostScanFailed { address: String, detail: String },
    #[error("transfer to {address} failed: {detail}")]
    Transfer { address: String, detail: String },
    #[error("remote command on {address} failed: {detail}")]
    RemoteExec { address: String, detail: String },
    #[error("renewal tool failed: {detail}")]
    ExternalTool { detail: String },
    #[error("command `{program}` timed out after {seconds}s")]
    CommandTimeout { program: String, seconds: u64 },
    #[error("failed to spawn `{program}`: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<BundleError> for Error {
    fn from(e: BundleError) -> Self {
        match e {
            BundleError::NotFound => Self::CertificateNotFound,
            other => Self::Bundle(other),
        }
    }
}
