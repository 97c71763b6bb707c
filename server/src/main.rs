use clap::Parser;
use log::{info, warn};
use server::game::HitPolicy;
use server::network::{GameServer, ServerConfig, DEFAULT_TICK_RATE};
use shared::discovery::{KeyValueStore, RedisStore, ServiceRegistration};
use shared::{Endpoint, SessionConfig, SessionOptions};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the session config file
    #[arg(short = 'c', long, default_value = "./config.json")]
    config: String,

    /// IP address to bind to and advertise
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    ip: String,

    /// Port to listen on
    #[arg(short = 'p', long)]
    port: u16,

    /// Server name used for discovery
    #[arg(short = 'n', long)]
    name: String,

    /// Service registry URL
    #[arg(long, default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    /// Run without registering for discovery
    #[arg(long)]
    no_registry: bool,

    /// Simulation ticks per second
    #[arg(short = 't', long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short = 'm', long, default_value_t = 32)]
    max_clients: usize,

    /// What happens to a player hit by a projectile
    #[arg(long, value_enum, default_value_t = HitPolicy::Respawn)]
    hit_policy: HitPolicy,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let options = SessionOptions::from_config(SessionConfig::load(&args.config)?);
    info!(
        "Loaded {} with {} walls (boundary included)",
        args.config,
        options.walls.len()
    );

    let config = ServerConfig {
        address: format!("{}:{}", args.ip, args.port),
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        hit_policy: args.hit_policy,
    };
    let mut server = GameServer::new(options, config);
    server.bind().await?;

    if args.no_registry {
        warn!("Running without service registry; the matchmaker will not find this server");
    } else {
        let redis_url = args.redis_url.clone();
        let name = args.name.clone();
        let endpoint = Endpoint::new(args.ip.clone(), args.port);
        let registration = tokio::task::spawn_blocking(move || {
            let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::open(&redis_url)?);
            ServiceRegistration::register(store, name, &endpoint)
        })
        .await??;
        server = server.with_registration(registration);
    }

    info!("Server '{}' starting at {} Hz", args.name, args.tick_rate);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
