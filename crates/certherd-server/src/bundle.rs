//! Read-only view of the canonical certificate bundle directory.
//!
//! The renewal tool owns the directory; this module only reads it. The
//! version token is the SHA-256 of the canonical file, so it changes exactly
//! when the certificate bytes change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::error::BundleError;

/// File names served and pushed; anything else in the directory is ignored.
pub const BUNDLE_FILES: &[&str] = &[
    "README",
    "cert.pem",
    "chain.pem",
    "fullchain.pem",
    "privkey.pem",
];

/// The file whose bytes define the version token and carry the leaf cert.
pub const CANONICAL_FILE: &str = "fullchain.pem";

#[derive(Debug, Clone)]
pub struct CertBundle {
    dir: PathBuf,
}

impl CertBundle {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn canonical_path(&self) -> PathBuf {
        self.dir.join(CANONICAL_FILE)
    }

    fn read_canonical(&self) -> Result<Vec<u8>, BundleError> {
        let path = self.canonical_path();
        if !path.exists() {
            return Err(BundleError::NotFound);
        }
        std::fs::read(&path).map_err(|source| BundleError::Io { path, source })
    }

    /// Current version token: lowercase hex SHA-256 of the canonical file.
    pub fn current_version(&self) -> Result<String, BundleError> {
        let bytes = self.read_canonical()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Contents of every recognized file present in the bundle directory.
    pub fn contents(&self) -> Result<BTreeMap<String, String>, BundleError> {
        if !self.canonical_path().exists() {
            return Err(BundleError::NotFound);
        }
        let mut files = BTreeMap::new();
        for name in BUNDLE_FILES {
            let path = self.dir.join(name);
            if !path.exists() {
                continue;
            }
            let contents =
                std::fs::read_to_string(&path).map_err(|source| BundleError::Io { path, source })?;
            files.insert((*name).to_owned(), contents);
        }
        Ok(files)
    }

    /// On-disk paths of the recognized files present, for push transfer.
    pub fn file_paths(&self) -> Result<Vec<PathBuf>, BundleError> {
        if !self.canonical_path().exists() {
            return Err(BundleError::NotFound);
        }
        Ok(BUNDLE_FILES
            .iter()
            .map(|name| self.dir.join(name))
            .filter(|path| path.exists())
            .collect())
    }

    /// Whole days until the leaf certificate's notAfter. Negative once the
    /// certificate has expired.
    pub fn days_until_expiry(&self) -> Result<i64, BundleError> {
        let bytes = self.read_canonical()?;
        let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes)
            .map_err(|e| BundleError::Parse(e.to_string()))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| BundleError::Parse(e.to_string()))?;
        let not_after = cert.validity().not_after.timestamp();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Ok((not_after - now).div_euclid(86_400))
    }
}
