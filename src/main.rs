use bridge_manager::{config::Config, App};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bridge-manager")]
#[command(version)]
#[command(about = "A Matrix Application-Service multiplexer fronting a dynamic population of bridges")]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Generate example config and exit
    #[arg(long)]
    generate_config: bool,
}

const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.generate_config {
        println!("{}", EXAMPLE_CONFIG);
        return Ok(());
    }

    FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .pretty()
        .init();

    info!("Starting bridge manager v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.to_string_lossy();
    info!("Loading config from {}", config_path);

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(e);
        }
    };

    let app = App::new(config).await?;

    tokio::select! {
        result = app.start() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Bridge manager stopped");

    Ok(())
}
