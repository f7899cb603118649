//! tabcast host daemon — entry point.
//!
//! ```text
//! tabcast-host                   Run in the foreground
//! tabcast-host --port 9000       Override the listening port
//! tabcast-host --config <path>   Load a custom config TOML
//! tabcast-host --gen-config      Print the default config and exit
//! tabcast-host --list-encoders   Probe available H.265 backends
//! ```

mod config;
mod service;

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::HostConfig;
use service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tabcast-host", about = "Stream a virtual display to an Android tablet")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listening port (overrides the config file).
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overrides the config file).
    #[arg(long)]
    log_level: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// List the H.265 encoder backends available on this host.
    #[arg(long)]
    list_encoders: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&HostConfig::default())?);
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(HostConfig::default_path);
    let mut config = HostConfig::load(&config_path);
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    config = config.normalized();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cli.log_level.as_deref().unwrap_or(&config.logging.level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.list_encoders {
        let backends = tabcast_core::encoder::available_backends();
        if backends.is_empty() {
            println!("no H.265 encoder backends available");
        } else {
            for name in backends {
                println!("{name}");
            }
        }
        return Ok(());
    }

    info!("tabcast-host v{}", env!("CARGO_PKG_VERSION"));
    info!("port: {}", config.network.port);
    info!(
        "display: {}x{} @ {} Hz",
        config.display.width,
        config.display.height,
        config.effective_refresh()
    );
    info!("bitrate: {} Mbps", config.effective_bitrate());

    let service = HostService::new(config, Some(config_path));
    service.run().await?;

    Ok(())
}
