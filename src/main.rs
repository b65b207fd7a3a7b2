use anyhow::Result;
use clap::Parser;
use tracing::info;

use m3u_proxy_cache::config::Config;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A local HTTP caching proxy for HLS video streams")]
struct Cli {
    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Cache budget in bytes
    #[arg(long, value_name = "BYTES")]
    max_cache_bytes: Option<u64>,

    /// Persist only the first few segments per origin host
    #[arg(long)]
    head_only: bool,

    /// Override the configured cache directory
    #[arg(long, value_name = "DIR")]
    cache_root: Option<std::path::PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("m3u_proxy_cache={}", cli.log_level).into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Merge CLI overrides into the config and write it back, so the facade's
    // own `Config::load()` (triggered lazily by `start_server`) picks up the
    // same cache root without the public API needing a fourth parameter.
    let mut config = Config::load()?;
    if let Some(root) = cli.cache_root {
        config.server.cache_root = root;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(max_bytes) = cli.max_cache_bytes {
        config.server.max_cache_bytes = max_bytes;
    }
    config.server.head_only = config.server.head_only || cli.head_only;

    let config_file = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
    std::fs::write(&config_file, toml::to_string_pretty(&config)?)?;

    let port = config.server.port;
    let max_cache_bytes = config.server.max_cache_bytes;
    let head_only = config.server.head_only;

    info!(port, max_cache_bytes, head_only, "starting proxy server");
    m3u_proxy_cache::start_server(Some(port), Some(max_cache_bytes), Some(head_only)).await?;

    info!("listening; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    m3u_proxy_cache::facade::stop_server().await;

    Ok(())
}
