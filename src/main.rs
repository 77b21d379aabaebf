mod bridge;
mod config;
mod forwarder;
mod gotify;
mod platform;
mod template;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::Bridge;
use crate::config::Config;

/// Map a `LOG_LEVEL` value to a tracing level; unknown values mean debug
fn log_level(value: Option<&str>) -> Level {
    let Some(value) = value else {
        return Level::INFO;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "warning" => Level::WARN,
        "fatal" | "panic" => Level::ERROR,
        other => other.parse().unwrap_or(Level::DEBUG),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    // Initialize logging: RUST_LOG wins, then LOG_LEVEL
    let level = log_level(std::env::var("LOG_LEVEL").ok().as_deref());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(level).into())
                .parse_lossy("")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from("config.toml");
        default.exists().then_some(default)
    });

    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("No config file, reading configuration from the environment"),
    }
    let config = Config::load(config_path.as_deref())
        .context("Not all settings are present or valid. Exiting.")?;

    info!("Configuration loaded successfully");
    info!("  Gotify host: {}", config.gotify.host);
    info!("  Telegram chat: {}", config.telegram.chat_id);
    info!(
        "  Template: {} (reload: {})",
        config.template.path.display(),
        config.template.reload
    );
    info!("  Reconnect delay: {}ms", config.stream.reconnect_delay_ms);

    let bridge = Bridge::enable(&config)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    bridge.disable().await;

    Ok(())
}
