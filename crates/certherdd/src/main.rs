use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use certherd_server::client::PullClient;
use certherd_server::command::{CommandRunner, ShellRunner};
use certherd_server::handlers::RegistrationRequest;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "certherdd",
    about = "Certherdd — certificate push-distribution server daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ServeArgs {
    /// Port to listen on (default: $CERTHERD_PORT or 8000)
    #[arg(long, env = "CERTHERD_PORT", default_value = "8000")]
    port: u16,
    /// Host to bind (default: $CERTHERD_HOST or 0.0.0.0)
    #[arg(long, env = "CERTHERD_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Certificate bundle directory (default: /etc/letsencrypt/live/$CERTHERD_DOMAIN)
    #[arg(long, env = "CERTHERD_CERT_DIR")]
    cert_dir: Option<PathBuf>,
    /// Data directory for the registry database and access key
    #[arg(long, env = "CERTHERD_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Shell command invoking the external renewal tool (default: "certbot renew")
    #[arg(long, env = "CERTHERD_RENEW_COMMAND")]
    renew_command: Option<String>,
    /// Renew once this many days (or fewer) remain before expiry (default: 20)
    #[arg(long, env = "CERTHERD_RENEW_THRESHOLD_DAYS")]
    renew_threshold_days: Option<i64>,
    /// Renewal check period, e.g. "1day" or "12h" (default: 1day)
    #[arg(long, env = "CERTHERD_RENEW_PERIOD", value_parser = humantime::parse_duration)]
    renew_period: Option<Duration>,
    /// Comma-separated CIDRs/addresses permitted to call the API
    #[arg(long, env = "CERTHERD_ALLOWED_SOURCES")]
    allowed_sources: Option<String>,
    /// Endpoint receiving JSON event notifications
    #[arg(long, env = "CERTHERD_NOTIFY_URL")]
    notify_url: Option<String>,
    /// Signing secret for event notifications
    #[arg(long, env = "CERTHERD_NOTIFY_SECRET")]
    notify_secret: Option<String>,
    /// Upper bound on concurrent subscriber pushes (default: 4)
    #[arg(long, env = "CERTHERD_PUSH_PARALLELISM")]
    push_parallelism: Option<usize>,
    /// Log level: error, warn, info, debug, verbose (default: $CERTHERD_LOG_LEVEL or info)
    #[arg(long, env = "CERTHERD_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the certherd HTTP server and renewal scheduler
    Serve(ServeArgs),
    /// Print the shared access key (generating it on first use)
    ShowKey,
    /// Pull the current bundle from a certherd server into a directory
    Fetch {
        /// Server origin, e.g. http://cert.example.org:8000
        #[arg(long)]
        server: String,
        #[arg(long, env = "CERTHERD_ACCESS_KEY")]
        access_key: String,
        /// Directory receiving the bundle files
        #[arg(long)]
        out_dir: PathBuf,
        /// Local command run after a successful fetch
        #[arg(long)]
        after_script: Option<String>,
    },
    /// Register this node with a certherd server for pushes
    Register {
        /// Server origin, e.g. http://cert.example.org:8000
        #[arg(long)]
        server: String,
        #[arg(long, env = "CERTHERD_ACCESS_KEY")]
        access_key: String,
        /// Remote account the server pushes as
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "22")]
        ssh_port: u16,
        /// Directory on this node receiving the bundle
        #[arg(long)]
        cert_dir: String,
        /// Command the server runs here after each push
        #[arg(long, default_value = "")]
        after_script: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let effective_log_level = if let Commands::Serve(ref args) = cli.command {
        let raw = args
            .log_level
            .clone()
            .or_else(|| std::env::var("CERTHERD_LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".into());
        if raw.eq_ignore_ascii_case("verbose") {
            "debug".to_owned()
        } else {
            raw
        }
    } else {
        std::env::var("CERTHERD_LOG_LEVEL").unwrap_or_else(|_| "warn".into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,

        Commands::ShowKey => cmd_show_key(),

        Commands::Fetch {
            server,
            access_key,
            out_dir,
            after_script,
        } => cmd_fetch(server, access_key, out_dir, after_script).await,

        Commands::Register {
            server,
            access_key,
            user,
            ssh_port,
            cert_dir,
            after_script,
        } => cmd_register(server, access_key, user, ssh_port, cert_dir, after_script).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let mut cfg = certherd_server::ServerConfig {
        host: args.host,
        port: args.port,
        ..Default::default()
    };
    if let Some(dir) = args.cert_dir {
        cfg.cert_dir = dir;
    }
    if args.data_dir.is_some() {
        cfg.data_dir = args.data_dir;
    }
    if let Some(command) = args.renew_command {
        cfg.renew_command = command;
    }
    if let Some(days) = args.renew_threshold_days {
        cfg.renew_threshold_days = days;
    }
    if let Some(period) = args.renew_period {
        cfg.renew_check_period = period;
    }
    if args.allowed_sources.is_some() {
        cfg.allowed_sources = args.allowed_sources;
    }
    if args.notify_url.is_some() {
        cfg.notify_url = args.notify_url;
    }
    if args.notify_secret.is_some() {
        cfg.notify_secret = args.notify_secret;
    }
    if let Some(parallelism) = args.push_parallelism {
        cfg.push_parallelism = parallelism;
    }

    certherd_server::run(cfg).await
}

fn cmd_show_key() -> Result<()> {
    let data_dir_env = std::env::var("CERTHERD_DATA_DIR").ok().map(Into::into);
    let data_dir = certherd_server::resolve_data_dir(data_dir_env.as_ref())?;
    let key = certherd_server::load_or_create_access_key(&data_dir)?;
    println!("{}", key.expose());
    Ok(())
}

async fn cmd_fetch(
    server: String,
    access_key: String,
    out_dir: PathBuf,
    after_script: Option<String>,
) -> Result<()> {
    let client = PullClient::new(&server, &access_key);

    let version = client.fetch_version().await.context("fetch version")?;
    println!("server bundle version: {version}");

    let written = client
        .fetch_bundle(&out_dir)
        .await
        .context("fetch bundle")?;
    for name in &written {
        println!("wrote {}", out_dir.join(name).display());
    }

    if let Some(script) = after_script {
        let args = vec!["-c".to_string(), script.clone()];
        let out = ShellRunner
            .run("sh", &args, Duration::from_secs(600))
            .await
            .with_context(|| format!("run after script `{script}`"))?;
        if !out.output.is_empty() {
            println!("{}", out.output);
        }
        if !out.success {
            anyhow::bail!("after script `{script}` failed");
        }
    }
    Ok(())
}

async fn cmd_register(
    server: String,
    access_key: String,
    user: String,
    ssh_port: u16,
    cert_dir: String,
    after_script: String,
) -> Result<()> {
    let client = PullClient::new(&server, &access_key);
    let publickey = client
        .register(&RegistrationRequest {
            user: user.clone(),
            ssh_port,
            cert_dir,
            after_script,
        })
        .await
        .context("register")?;

    println!("registered with {server}");
    if publickey.is_empty() {
        println!("server returned no push key; pushes need manual key setup");
    } else {
        println!("authorize this key for {user} to receive pushes:");
        println!("{publickey}");
    }
    Ok(())
}
