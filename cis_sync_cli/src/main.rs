mod cli;

use std::sync::Arc;

use cis_sync::events::memory::{LoggingAlertSink, LoggingEventBus};
use cis_sync::{SqliteSyncStore, SyncConfig, SyncService};
use clap::Parser;
use cli::{Cli, Commands};

fn print_json(v: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

#[tokio::main]
#[tracing::instrument(level = "info")]
async fn main() -> anyhow::Result<()> {
    cis_sync::telemetry::init_tracing()?;
    let cli = Cli::parse();

    let mut cfg = SyncConfig::from_env()?;
    if let Some(path) = cli.local_db {
        cfg.local_db_path = path;
    }

    let store = Arc::new(SqliteSyncStore::new(&cfg.local_db_path).await?);
    let bus = Arc::new(LoggingEventBus);
    let service = Arc::new(SyncService::from_config(
        cfg,
        store,
        bus,
        Arc::new(LoggingAlertSink),
    )?);
    service.bootstrap().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            service.start_sync().await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            service.stop_sync().await;
        }
        Commands::Once { table } => {
            let runs = service.trigger_cycle(table.as_deref()).await?;
            service.connection().close().await;
            print_json(&runs)?;
        }
        Commands::Status => {
            let status = service.get_status().await?;
            service.connection().close().await;
            print_json(&status)?;
        }
        Commands::History { limit } => {
            print_json(&service.get_run_history(limit).await?)?;
        }
        Commands::Health => {
            print_json(&service.get_health_report().await)?;
        }
        Commands::Check => {
            let connected = service.test_connection().await;
            let privileges = service.connection().verify_read_only_privileges().await;
            service.connection().close().await;
            print_json(&serde_json::json!({
                "connected": connected,
                "privileges": privileges,
            }))?;
            if !connected || !privileges.safe {
                anyhow::bail!("external source failed the read-only check");
            }
        }
        Commands::ResetWatermark { table } => {
            service.reset_watermark(&table).await?;
            println!("watermark reset: {table}");
        }
        Commands::SetEnabled { table, enabled } => {
            service.set_table_enabled(&table, enabled).await?;
            println!("{table}: enabled={enabled}");
        }
    }
    Ok(())
}
