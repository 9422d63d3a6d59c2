pub mod auth;
pub mod bundle;
pub mod client;
pub mod command;
pub mod dirs;
pub mod distribute;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod renewal;
pub mod server;
pub mod store;
pub mod trust;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    /// Shared secret every API request must sign with.
    pub access_key: auth::AccessKey,
    /// Optional source allow-list; `None` admits any source address.
    pub allowlist: Option<Arc<auth::SourceAllowlist>>,
    pub bundle: bundle::CertBundle,
    /// Notification sink (absent when no target is configured).
    pub notifier: Option<notify::Notifier>,
    pub trust: trust::TrustBootstrap,
    /// Public half of the push identity, returned on registration.
    pub push_pubkey: Arc<String>,
}

pub use server::{load_or_create_access_key, resolve_data_dir, router, run, ServerConfig};
