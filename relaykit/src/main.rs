mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use relaykit_core::{load_config, logging};

use server::{build_pubsub, RelayService};

#[derive(Parser, Debug)]
#[command(name = "relaykit")]
#[command(about = "Pub/sub relay with an HTTP health surface", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "RELAYKIT_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(relaykit_core::Error::Validation(errors)) => {
            for e in &errors {
                eprintln!("Config validation error: {e}");
            }
            return Err(anyhow::anyhow!(
                "Configuration validation failed with {} error(s)",
                errors.len()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("relaykit starting...");
    info!("HTTP address: {}", config.server.listen_address);
    info!(broker = config.broker_enabled(), "Pub/sub backend selected");

    // 3. Pub/sub backend
    let pubsub = build_pubsub(&config.pubsub)?;

    // 4. Serve until shutdown
    RelayService::new(config, pubsub).run().await
}
