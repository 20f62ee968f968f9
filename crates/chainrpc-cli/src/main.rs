use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use chainrpc_cli::{
    cli::{Cli, Commands},
    commands,
};
use chainrpc_config::ConfigLoader;
use chainrpc_engine::RpcEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the command-line level
    let level = cli.level();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "chainrpc_cli={level},chainrpc_engine={level},chainrpc_config={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ConfigLoader::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.connection.endpoint = Some(endpoint);
    }
    debug!(endpoint = ?config.connection.endpoint, "Configuration loaded");

    let engine = RpcEngine::connect(config).context("Failed to start engine")?;
    let mut stdout = std::io::stdout();

    let outcome = match cli.command {
        Commands::Call { method, params } => {
            let params = commands::parse_params(params.as_deref())?;
            commands::call(&engine, &method, params, &mut stdout).await
        }
        Commands::Subscribe {
            method,
            params,
            unsubscribe,
            count,
        } => {
            let params = commands::parse_params(params.as_deref())?;
            commands::subscribe(&engine, &method, params, unsubscribe, count, &mut stdout)
                .await
                .map(|received| debug!(received, "Subscription finished"))
        }
    };

    engine.shutdown();
    engine.closed().await;
    outcome
}
