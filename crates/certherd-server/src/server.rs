use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use rand::Rng;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{require_signature, AccessKey, SourceAllowlist},
    bundle::CertBundle,
    command::{CommandRunner, ShellRunner},
    distribute::{DistributionConfig, DistributionEngine},
    handlers::{get_cert, get_version, register},
    notify::Notifier,
    renewal::RenewalScheduler,
    store::Store,
    trust::TrustBootstrap,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory the renewal tool writes the bundle into.
    pub cert_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    /// Shell command invoking the external renewal tool.
    pub renew_command: String,
    /// Renew once this few days (or fewer) remain before expiry.
    pub renew_threshold_days: i64,
    pub renew_check_period: Duration,
    /// Registrations older than this are evicted during a pass.
    pub subscriber_ttl: Duration,
    /// Comma-separated CIDRs/addresses permitted to call the API.
    pub allowed_sources: Option<String>,
    pub notify_url: Option<String>,
    pub notify_secret: Option<String>,
    pub push_parallelism: usize,
    pub remote_timeout: Duration,
    /// Private key for the push channel; its `.pub` sibling is returned to
    /// registering subscribers.
    pub identity_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("CERTHERD_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("CERTHERD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            cert_dir: default_cert_dir(),
            data_dir: std::env::var("CERTHERD_DATA_DIR").ok().map(PathBuf::from),
            renew_command: std::env::var("CERTHERD_RENEW_COMMAND")
                .unwrap_or_else(|_| "certbot renew".into()),
            renew_threshold_days: std::env::var("CERTHERD_RENEW_THRESHOLD_DAYS")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(20),
            renew_check_period: duration_env("CERTHERD_RENEW_PERIOD", Duration::from_secs(86_400)),
            subscriber_ttl: Duration::from_secs(
                86_400
                    * std::env::var("CERTHERD_SUBSCRIBER_TTL_DAYS")
                        .ok()
                        .and_then(|d| d.parse().ok())
                        .unwrap_or(60),
            ),
            allowed_sources: std::env::var("CERTHERD_ALLOWED_SOURCES").ok(),
            notify_url: std::env::var("CERTHERD_NOTIFY_URL").ok(),
            notify_secret: std::env::var("CERTHERD_NOTIFY_SECRET").ok(),
            push_parallelism: std::env::var("CERTHERD_PUSH_PARALLELISM")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4),
            remote_timeout: duration_env("CERTHERD_REMOTE_TIMEOUT", Duration::from_secs(30)),
            identity_file: std::env::var("CERTHERD_IDENTITY_FILE")
                .ok()
                .map(PathBuf::from),
        }
    }
}

fn default_cert_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CERTHERD_CERT_DIR") {
        return PathBuf::from(dir);
    }
    let domain = std::env::var("CERTHERD_DOMAIN").unwrap_or_else(|_| "localhost".into());
    PathBuf::from("/etc/letsencrypt/live").join(domain)
}

fn duration_env(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|raw| humantime::parse_duration(&raw).ok())
        .unwrap_or(default)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let access_key = load_or_create_access_key(&data_dir)?;

    let store = Store::open(&data_dir.join("certherd.db")).context("open store")?;
    let bundle = CertBundle::new(cfg.cert_dir.clone());
    info!(cert_dir = %bundle.dir().display(), "watching certificate bundle");

    let notifier = cfg
        .notify_url
        .clone()
        .map(|url| Notifier::new(url, cfg.notify_secret.clone()));

    let allowlist = match cfg.allowed_sources.as_deref() {
        Some(raw) => Some(Arc::new(
            SourceAllowlist::parse(raw)
                .map_err(|e| anyhow::anyhow!("CERTHERD_ALLOWED_SOURCES: {e}"))?,
        )),
        None => None,
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let trust = TrustBootstrap::new(store.clone(), Arc::clone(&runner), cfg.remote_timeout);
    let engine = DistributionEngine::new(
        store.clone(),
        bundle.clone(),
        trust.clone(),
        Arc::clone(&runner),
        notifier.clone(),
        DistributionConfig {
            subscriber_ttl: cfg.subscriber_ttl,
            parallelism: cfg.push_parallelism,
            remote_timeout: cfg.remote_timeout,
            identity_file: cfg.identity_file.clone(),
        },
    );

    let scheduler = Arc::new(RenewalScheduler::new(
        bundle.clone(),
        engine,
        Arc::clone(&runner),
        notifier.clone(),
        cfg.renew_command.clone(),
        cfg.renew_threshold_days,
    ));
    scheduler.spawn(cfg.renew_check_period);

    let push_pubkey = load_push_pubkey(cfg.identity_file.as_deref());

    let state = AppState {
        store,
        access_key,
        allowlist,
        bundle,
        notifier,
        trust,
        push_pubkey: Arc::new(push_pubkey),
    };

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "certherd server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// API router with every route behind the signature gate. Exported so
/// tests can drive the API without binding a configured server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get_version", get(get_version))
        .route("/get_cert", get(get_cert))
        .route("/registration", post(register))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_signature,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn resolve_data_dir(overridden: Option<&PathBuf>) -> Result<PathBuf> {
    match overridden {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("create data dir")?;
            Ok(dir.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Load the shared access key, generating and persisting one on first run.
pub fn load_or_create_access_key(data_dir: &Path) -> Result<AccessKey> {
    let key_path = data_dir.join("access.key");
    if key_path.exists() {
        let raw = std::fs::read_to_string(&key_path).context("read access.key")?;
        let key = raw.trim();
        if key.is_empty() {
            anyhow::bail!("access.key is empty; delete it to generate a new key");
        }
        Ok(AccessKey::new(key.to_owned()))
    } else {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let key = hex::encode(bytes);
        std::fs::write(&key_path, &key).context("write access.key")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .context("chmod access.key")?;
        }
        info!("generated new access key");
        Ok(AccessKey::new(key))
    }
}

/// Public half of the push identity, served to registering subscribers.
/// Missing key material downgrades to an empty string so registration
/// still works for pull-only fleets.
fn load_push_pubkey(identity_file: Option<&Path>) -> String {
    let resolved = match identity_file {
        Some(identity) => {
            let mut name = identity.as_os_str().to_owned();
            name.push(".pub");
            PathBuf::from(name)
        }
        None => {
            let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
            home.join(".ssh").join("id_ed25519.pub")
        }
    };
    match std::fs::read_to_string(&resolved) {
        Ok(key) => key.trim().to_owned(),
        Err(e) => {
            warn!(
                path = %resolved.display(),
                error = %e,
                "push public key unreadable; registrations will receive an empty key"
            );
            String::new()
        }
    }
}
