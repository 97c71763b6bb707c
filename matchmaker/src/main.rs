use clap::Parser;
use log::{info, warn};
use matchmaker::directory::{Scanner, ServerDirectory};
use matchmaker::network::{Matchmaker, MatchmakerConfig, DEFAULT_PORT};
use shared::discovery::{KeyValueStore, RedisStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// IP address to listen on
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    ip: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Service registry URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    /// Milliseconds between registry scans
    #[arg(long, default_value_t = 1000)]
    scan_interval_ms: u64,

    /// Milliseconds between attempts while no server is available
    #[arg(long, default_value_t = 1000)]
    retry_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let redis_url = args.redis_url.clone();
    let store: Arc<dyn KeyValueStore> =
        Arc::new(tokio::task::spawn_blocking(move || RedisStore::open(&redis_url)).await??);
    info!("Using registry at {}", args.redis_url);

    let directory = ServerDirectory::new();
    let mut scanner = Scanner::start(
        store,
        directory.clone(),
        Duration::from_millis(args.scan_interval_ms),
    )?;

    let config = MatchmakerConfig {
        address: format!("{}:{}", args.ip, args.port),
        retry: Duration::from_millis(args.retry_ms),
    };
    Matchmaker::new(directory, config)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await?;

    tokio::task::spawn_blocking(move || scanner.stop()).await?;
    info!("Matchmaker stopped");
    Ok(())
}
