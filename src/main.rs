use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use wafleet::cp::server::{build_router, CpState};
use wafleet::db::Registry;
use wafleet::observability::init_logging;
use wafleet::{Collaborators, Config, InstanceManager};

#[derive(Parser)]
#[command(name = "wafleet", version, about = "Multi-instance WhatsApp connection manager")]
struct Cli {
    /// Path to the TOML config file. Missing file means defaults.
    #[arg(long, global = true, default_value = "wafleet.toml")]
    config: PathBuf,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore and reconnect registered instances, then serve the control plane.
    Serve,
    /// List registered instances.
    Instances,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Instances => list_instances(&config),
    }
}

async fn serve(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    let collaborators = Collaborators::from_config(&config)?;
    let manager = Arc::new(InstanceManager::open(config, collaborators)?);

    let reconnecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.auto_reconnect().await })
    };

    let app = build_router(CpState {
        manager: manager.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind control plane on {bind}"))?;
    tracing::info!("control plane listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("shutting down");
        })
        .await
        .context("control plane server failed")?;

    reconnecting.abort();
    manager.shutdown().await;
    Ok(())
}

fn list_instances(config: &Config) -> Result<()> {
    let registry = Registry::open(&config.registry_path())?;
    let instances = registry.list_instances()?;
    if instances.is_empty() {
        println!("No instances registered.");
        return Ok(());
    }
    println!("{:<38} {:<24} {:<18} CREATED", "ID", "NAME", "PHONE");
    for inst in instances {
        println!(
            "{:<38} {:<24} {:<18} {}",
            inst.id,
            inst.name,
            inst.phone_number.as_deref().unwrap_or("-"),
            inst.created_at
        );
    }
    Ok(())
}
