use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shrinkarr")]
#[command(about = "Library re-encoding pipeline daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline supervisor (default)
    Run,
    /// Reset every failed video back to the front of the pipeline
    ResetFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    info!("shrinkarr v{}", env!("CARGO_PKG_VERSION"));

    let settings = match shrinkarr_daemon::config::load_settings(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Database: {}", settings.database.url);
            info!("Temp dir: {:?}", settings.tool.tmp_dir);
            info!("External tool: {}", settings.tool.ab_av1_bin);
            info!(
                "VMAF target: {} (search timeout {}s, encode timeout {}s)",
                settings.crf_search.vmaf_target,
                settings.crf_search.timeout_ms / 1000,
                settings.encode.timeout_ms / 1000,
            );
            if settings.services.is_empty() {
                info!("No library sources configured; encode completions will not be announced");
            }

            if let Err(e) = shrinkarr_daemon::run_daemon(settings).await {
                error!("Daemon error: {}", e);
                return Err(e);
            }
        }
        Command::ResetFailed => {
            let store = shrinkarr_daemon::Store::connect(
                &settings.database.url,
                settings.database.max_connections,
            )
            .await?;
            store.migrate().await?;
            let reset = store.reset_failed().await?;
            info!("Reset {} failed videos to needs-analysis", reset);
        }
    }

    Ok(())
}
