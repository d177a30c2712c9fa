use clap::Parser;
use log::{error, info};
use server::network::Server;
use shared::GameConfig;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "9999")]
    port: u16,
    /// Players required before a game can start
    #[clap(long, default_value_t = shared::MIN_PLAYERS)]
    min_players: usize,
    /// Size of the roster
    #[clap(long, default_value_t = shared::MAX_PLAYERS)]
    max_players: usize,
    /// Werewolves drawn at game start
    #[clap(short, long, default_value_t = shared::MAX_WEREWOLVES)]
    werewolves: usize,
    /// Undecided day votes tolerated before the phase moves on
    #[clap(long, default_value_t = shared::DEFAULT_RETRY_BUDGET)]
    retry_budget: u32,
    /// Seed for reproducible role assignment
    #[clap(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: set RUST_LOG=info (or debug) to see server logs");
    }
    env_logger::init();

    let args = Args::parse();
    let config = GameConfig {
        min_players: args.min_players,
        max_players: args.max_players,
        max_werewolves: args.werewolves,
        retry_budget: args.retry_budget,
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config, args.seed).await?;
    let keep_running = server.keep_running();

    let server_handle = tokio::spawn(async move { server.run().await });

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped with error: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            keep_running.stop();
        }
    }

    Ok(())
}
