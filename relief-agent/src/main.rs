//! ReliefLine field sync agent
//!
//! Long-running daemon for a field device: opens the local store,
//! starts the sync engine and feeds it connectivity from a periodic
//! TCP probe against the reconciliation server. The field application
//! writes to the same store; this process gets the data out.

use anyhow::Context;
use clap::Parser;
use crypto::{Encryptor, NoOpEncryptor, PayloadEncryptor};
use relief_sync::{
    ConnectivityMonitor, HttpReconcileClient, LocalStore, LocalStoreConfig, SyncConfig, SyncEngine,
};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ReliefLine field device sync agent
#[derive(Parser, Debug)]
#[command(name = "relief-agent")]
#[command(about = "Offline-first sync agent for disaster relief field devices")]
struct Args {
    /// Path to the local database file
    #[arg(long, env = "RELIEF_DB_PATH", default_value = "relief_local.db")]
    db_path: String,

    /// Base URL of the reconciliation server
    #[arg(long, env = "RELIEF_SERVER_URL", default_value = "http://localhost:8080")]
    server_url: String,

    /// Bearer token for the reconciliation endpoint
    #[arg(long, env = "RELIEF_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Base64 key for payload encryption at rest
    #[arg(long, env = "RELIEF_ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    /// Seconds between periodic queue checks
    #[arg(long, default_value = "30")]
    sync_interval_secs: u64,

    /// Seconds between connectivity probes
    #[arg(long, default_value = "10")]
    probe_interval_secs: u64,

    /// host:port probed for connectivity, derived from the server URL
    /// when not set
    #[arg(long)]
    probe_addr: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Print a freshly generated encryption key and exit
    #[arg(long)]
    generate_key: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_key {
        println!("{}", PayloadEncryptor::generate_key_base64());
        return Ok(());
    }

    init_tracing(args.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting ReliefLine sync agent"
    );

    let encryptor: Arc<dyn Encryptor> = match &args.encryption_key {
        Some(key) => Arc::new(
            PayloadEncryptor::from_base64(key).context("Invalid encryption key")?,
        ),
        None => {
            tracing::warn!("No encryption key provided, payloads are stored in cleartext");
            Arc::new(NoOpEncryptor)
        }
    };

    let store = Arc::new(
        LocalStore::new(
            LocalStoreConfig {
                db_path: args.db_path.clone(),
                ..Default::default()
            },
            encryptor,
        )
        .await
        .context("Failed to open local store")?,
    );

    let config = SyncConfig {
        server_url: args.server_url.clone(),
        auth_token: args.auth_token.clone().map(SecretString::new),
        sync_check_interval: Duration::from_secs(args.sync_interval_secs),
        ..Default::default()
    };

    let probe_addr = match args.probe_addr.clone() {
        Some(addr) => addr,
        None => probe_target(&args.server_url)
            .context("Cannot derive a probe address from the server URL")?,
    };

    let client = Arc::new(HttpReconcileClient::new(&config)?);
    let connectivity = Arc::new(ConnectivityMonitor::new());
    let engine = Arc::new(
        SyncEngine::new(Arc::clone(&store), client, Arc::clone(&connectivity), config).await?,
    );

    info!(
        db_path = %args.db_path,
        server_url = %args.server_url,
        probe_addr = %probe_addr,
        device_id = %store.device_id(),
        "Agent configured"
    );

    Arc::clone(&engine).start().await;

    let event_log = {
        let mut events = engine.events().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => info!(?event, "Sync event"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event log fell behind");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let probe = {
        let connectivity = Arc::clone(&connectivity);
        let interval = Duration::from_secs(args.probe_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reachable = matches!(
                    tokio::time::timeout(
                        Duration::from_secs(5),
                        tokio::net::TcpStream::connect(&probe_addr),
                    )
                    .await,
                    Ok(Ok(_))
                );
                connectivity.set_online(reachable);
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    probe.abort();
    engine.shutdown().await;
    event_log.abort();
    store.close().await;
    info!("Agent stopped");

    Ok(())
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "relief_agent={},relief_sync={},sqlx=warn,reqwest=info",
            level, level
        )
        .into()
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Derive `host:port` to probe from the server URL
fn probe_target(server_url: &str) -> Option<String> {
    let (scheme, rest) = server_url.split_once("://")?;
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }

    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        let port = if scheme.eq_ignore_ascii_case("https") {
            443
        } else {
            80
        };
        Some(format!("{}:{}", authority, port))
    }
}
