//! Dataspace connector runtime
//!
//! ```text
//! ┌──────────┐    ┌──────────────────┐    ┌──────────────┐
//! │  Config  │───▶│ TransferProcess  │───▶│   DataFlow   │
//! │  (YAML)  │    │  state machine   │◀───│ state machine│
//! └──────────┘    └──────────────────┘    └──────────────┘
//! ```
//!
//! Usage: `dataspace_connector [--env <name>]` loads `config/<name>.yaml` (default `dev`)
//! and runs both state machines until Ctrl-C.

use anyhow::Context;

use dataspace_connector::config::AppConfig;
use dataspace_connector::logging::init_logging;
use dataspace_connector::runtime::ConnectorRuntime;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config)?;

    tracing::info!(runtime_id = %config.runtime_id, "Starting connector in {} mode", env);

    let runtime = ConnectorRuntime::builder(config).build().await?;
    let running = runtime.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining state machines");
    running.stop().await;
    tracing::info!("Connector stopped");
    Ok(())
}
