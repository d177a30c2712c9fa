//! Plays a whole game with bots: connects `count` clients, readies them all
//! and reports each bot's view of the result.

use clap::Parser;
use client::network::{Client, ClientConfig};
use log::{error, info, warn};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9999")]
    server: String,

    /// Number of bots
    #[arg(short = 'n', long, default_value_t = shared::MIN_PLAYERS)]
    count: usize,

    /// Share of peer datagrams actually sent (0.0 - 1.0)
    #[arg(short = 'd', long, default_value_t = shared::transport::DEFAULT_DELIVERY_PROBABILITY)]
    delivery: f64,
}

async fn run_bot(server: String, username: String, config: ClientConfig) -> shared::Result<()> {
    let client = Client::connect(&server, config).await?;

    match client.join(&username).await? {
        Some(reply) if reply.is_ok() => {
            info!("{} joined as player {:?}", username, reply.player_id);
        }
        other => {
            warn!("{} could not join: {:?}", username, other.and_then(|r| r.description));
            return Ok(());
        }
    }

    // Give every bot a chance to join before anyone is ready
    sleep(Duration::from_millis(200)).await;
    client.ready().await?;

    match client.run().await? {
        Some(winner) => {
            let state = client.state().await;
            let role = state.role.map(|role| role.to_string()).unwrap_or_default();
            info!("{} ({}) saw the {} side win on day {}", username, role, winner, state.days);
        }
        None => warn!("{} was disconnected before the end", username),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Starting {} bots against {}", args.count, args.server);

    let config = ClientConfig {
        delivery_probability: args.delivery,
        ..ClientConfig::default()
    };

    let mut handles = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let server = args.server.clone();
        let config = config.clone();
        handles.push(tokio::spawn(run_bot(server, format!("bot-{}", i), config)));
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Bot failed: {}", e),
            Err(e) => error!("Bot task panicked: {}", e),
        }
    }

    info!("Swarm finished");
    Ok(())
}
