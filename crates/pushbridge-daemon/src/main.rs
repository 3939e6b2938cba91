use std::path::PathBuf;

use clap::Parser;
use pushbridge_daemon::cli::{run_daemon, BridgeConfig};
use pushbridge_daemon::tracing_setup::init_tracing;

#[derive(Parser)]
#[command(name = "pushbridge")]
#[command(about = "Push notifications for Nostr events matching registered filters")]
struct Cli {
    /// Path to JSON config file (privateKey, expoAccessToken, relayUrl, amqpUrl, ...)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialise logging: {:#}", e);
        std::process::exit(1);
    }

    let config = match cli.config {
        Some(path) => match BridgeConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{:#}", e);
                std::process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    if let Err(e) = run_daemon(config) {
        eprintln!("Daemon error: {:#}", e);
        std::process::exit(1);
    }
}
