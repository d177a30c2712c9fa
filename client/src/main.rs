use clap::Parser;
use client::network::{Client, ClientConfig};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9999")]
    server: String,

    /// Name shown to the other players
    #[arg(short = 'u', long)]
    username: String,

    /// Share of peer datagrams actually sent (0.0 - 1.0)
    #[arg(short = 'd', long, default_value_t = shared::transport::DEFAULT_DELIVERY_PROBABILITY)]
    delivery: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Connecting to: {}", args.server);
    let config = ClientConfig {
        delivery_probability: args.delivery,
        ..ClientConfig::default()
    };
    let client = Client::connect(&args.server, config).await?;

    match client.join(&args.username).await? {
        Some(reply) if reply.is_ok() => {}
        Some(reply) => {
            error!("Join refused: {}", reply.description.unwrap_or_default());
            return Ok(());
        }
        None => {
            error!("Server did not answer the join request");
            return Ok(());
        }
    }

    match client.ready().await? {
        Some(reply) if !reply.is_ok() => {
            error!("Ready refused: {}", reply.description.unwrap_or_default());
            return Ok(());
        }
        _ => info!("Waiting for the game to start"),
    }

    tokio::select! {
        result = client.run() => {
            match result? {
                Some(winner) => info!("Game finished, the {} side won", winner),
                None => info!("Disconnected before the game finished"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, leaving the game...");
            if let Err(e) = client.leave().await {
                error!("Leave failed: {}", e);
            }
            client.stop().await;
        }
    }

    Ok(())
}
