use clap::Parser;
use client::network::{ClientError, GridClient};
use client::replica::ReplicaGrid;
use log::{info, warn};
use rand::Rng;
use shared::{GridDimensions, ServerPacket, PALETTE_SIZE};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Bot that places random pixels and follows the canvas.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Number of random pixels to place
    #[arg(short = 'e', long, default_value = "100")]
    edits: usize,

    /// Edits per second
    #[arg(short = 'r', long, default_value = "10")]
    rate: u32,

    /// Keep following live updates for this long after the last edit
    #[arg(long, default_value = "2")]
    watch_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);

    let mut client = GridClient::connect(&args.server).await?;

    let snapshot = client.next_packet_timeout(Duration::from_secs(10)).await?;
    let mut replica = match &snapshot {
        ServerPacket::BatchUpdate(batch) => {
            let height = batch.grid.len();
            let width = batch.grid.first().map_or(0, |row| row.len());
            let mut replica = ReplicaGrid::new(GridDimensions::new(width, height));
            replica.apply(&snapshot);
            replica
        }
        other => return Err(format!("expected BATCH_UPDATE first, got {:?}", other).into()),
    };
    let dimensions = replica.dimensions();
    info!(
        "Synced {}x{} grid, placing {} pixels",
        dimensions.width, dimensions.height, args.edits
    );
    if dimensions.cell_count() == 0 {
        return Err("server sent an empty grid".into());
    }

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rng = rand::thread_rng();
    let mut placed = 0;

    while placed < args.edits {
        let next = tokio::select! {
            _ = ticker.tick() => None,
            packet = client.next_packet() => Some(packet),
        };
        match next {
            Some(packet) => replica.apply(&packet?),
            None => {
                let x = rng.gen_range(0..dimensions.width) as i64;
                let y = rng.gen_range(0..dimensions.height) as i64;
                let color = rng.gen_range(0..PALETTE_SIZE) as i64;
                client.place_pixel(x, y, color).await?;
                placed += 1;
            }
        }
    }

    let watch_until = Instant::now() + Duration::from_secs(args.watch_secs);
    loop {
        let remaining = watch_until.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match client.next_packet_timeout(remaining).await {
            Ok(packet) => replica.apply(&packet),
            Err(ClientError::Timeout(_)) => break,
            Err(e) => {
                warn!("Stopped following updates: {}", e);
                break;
            }
        }
    }

    info!(
        "Placed {} pixels, applied {} live updates",
        placed,
        replica.live_updates()
    );
    client.close().await?;
    Ok(())
}
