//! appcop - watches an orchestrator's event stream, scores misbehaving
//! applications, scales them down, and garbage collects the leftovers.

use std::fs::OpenOptions;
use std::sync::Arc;

use appcop::config::{Config, Flags, LogConfig};
use appcop::error::{AppcopError, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();
    let config = Config::load(&flags)?;
    init_logging(&config.log)?;

    info!(version = appcop::VERSION, "Starting appcop");
    appcop::service::run(config).await
}

fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(format!("appcop={},warn", config.level.to_lowercase()))
        .map_err(|err| AppcopError::Config(format!("bad log level: {err}")))?;

    let json = config.format.to_uppercase() == "JSON";
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.file.is_empty() {
        if json {
            builder.json().with_writer(std::io::stderr).init();
        } else {
            builder.with_writer(std::io::stderr).init();
        }
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)?;
    let writer = Arc::new(file);
    if json {
        builder.json().with_writer(writer).init();
    } else {
        builder.with_writer(writer).init();
    }
    Ok(())
}
