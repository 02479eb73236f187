use clap::Parser;
use log::{error, info, warn};
use server::config::{ServerConfig, DEFAULT_BROADCAST_CONCURRENCY, DEFAULT_HANDSHAKE_TIMEOUT};
use server::context::AppContext;
use server::network::NetworkServer;
use shared::GridDimensions;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Grid width in cells
    #[clap(long, default_value = "500")]
    width: usize,
    /// Grid height in cells
    #[clap(long, default_value = "500")]
    height: usize,
    /// Palette index filling a freshly created grid
    #[clap(long, default_value = "0")]
    fill_color: u8,
    /// Live update batching window; 0 sends every edit immediately
    #[clap(long, default_value = "250")]
    batch_window_ms: u64,
    /// Deadline for one send to one client
    #[clap(long, default_value = "10")]
    send_timeout_secs: u64,
    /// Close clients that send nothing for this long
    #[clap(long, default_value = "60")]
    idle_timeout_secs: u64,
    /// Keepalive ping interval
    #[clap(long, default_value = "30")]
    ping_interval_secs: u64,
    /// Minimum delay between two edits of one client; 0 disables it
    #[clap(long, default_value = "0")]
    pixel_cooldown_ms: u64,
    /// Maximum concurrent clients on this process
    #[clap(long)]
    max_sessions: Option<usize>,
    /// Redis holding the shared grid and update channel, e.g. redis://127.0.0.1:6379
    #[clap(long)]
    redis_url: Option<String>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            dimensions: GridDimensions::new(self.width, self.height),
            fill_color: self.fill_color,
            batch_window: Duration::from_millis(self.batch_window_ms),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pixel_cooldown: Duration::from_millis(self.pixel_cooldown_ms),
            max_sessions: self.max_sessions,
            broadcast_concurrency: DEFAULT_BROADCAST_CONCURRENCY,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = args.server_config();
    let ctx = match &args.redis_url {
        Some(url) => AppContext::with_redis(config, url).await?,
        None => {
            warn!("No --redis-url given, the grid lives in this process only");
            AppContext::in_memory(config)?
        }
    };
    let ctx = Arc::new(ctx);
    // Subscribe before the first client can connect.
    let propagation = ctx.start().await?;

    let address = format!("{}:{}", args.host, args.port);
    let server = NetworkServer::bind(&address, Arc::clone(&ctx)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Network server failed: {}", e);
                return Err(e.into());
            }
        }
        result = propagation.wait() => {
            if let Err(e) = result {
                error!("Update propagation stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    ctx.hub.shutdown().await;
    Ok(())
}
