use anyhow::{Context, Result};
use clap::Parser;
use shellmux::config::Args;
use shellmux::server::run_server;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Create ~/.shellmux if it doesn't exist
    let home_dir = dirs::home_dir().unwrap_or_else(|| ".".into());
    let log_dir = home_dir.join(".shellmux");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    // Each run starts with a fresh log file
    let log_path = log_dir.join("shellmux.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout.and(log_file))
        .init();

    info!("Starting shellmux (logging to {})", log_path.display());

    run_server(args).await
}
