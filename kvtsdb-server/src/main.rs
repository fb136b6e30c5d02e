//! kvtsdb Server - OpenTSDB-style HTTP API over the storage core

mod api;

use clap::Parser;
use kvtsdb_core::config::TsdbConfig;
use kvtsdb_core::store::{JournalConfig, SyncPolicy};
use kvtsdb_core::Tsdb;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "kvtsdb", version, about = "OpenTSDB-compatible time-series server")]
struct CliArgs {
    /// HTTP listen port
    #[arg(short, long, default_value_t = 4242, env = "KVTSDB_PORT")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "KVTSDB_BIND")]
    bind: String,

    /// Journal directory; data is kept in memory only when absent
    #[arg(long, env = "KVTSDB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Journal sync policy: always, never or every:<n>
    #[arg(long, default_value = "always", env = "KVTSDB_SYNC")]
    sync: SyncPolicy,

    /// Namespace qualifying every stored key
    #[arg(long, default_value = "default", env = "KVTSDB_NAMESPACE")]
    namespace: String,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = TsdbConfig::default().with_namespace(args.namespace.clone());
    let db = match &args.data_dir {
        Some(dir) => {
            info!("Data directory: {:?}", dir);
            Tsdb::open_with(JournalConfig::new(dir).with_sync_policy(args.sync), config)?
        }
        None => {
            info!("No data directory given, running in memory");
            Tsdb::in_memory(config)?
        }
    };

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let db = Arc::new(db);
    let app = api::create_router(db.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("kvtsdb listening on http://{} (namespace {})", addr, args.namespace);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    db.flush().await?;
    info!("kvtsdb stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
