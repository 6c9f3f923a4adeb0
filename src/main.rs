use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rt_5gms_af::cert_manager::ProcessCertificateManager;
use rt_5gms_af::config::Config;
use rt_5gms_af::engine::Engine;
use rt_5gms_af::http;

#[derive(Parser)]
#[command(name = "rt-5gms-af")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "5G Media Streaming Application Function (M1/M3/M5 control plane)")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

/// Exit codes per the certmgr/CLI contract: 0 clean shutdown, 1 configuration
/// error, 2 bind failure.
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_BIND_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let log_filter = if config.logging.json {
        format!("rt_5gms_af={}", config.logging.level)
    } else {
        format!("rt_5gms_af={},tower_http=info", config.logging.level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into());
    if config.logging.json {
        tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
    }

    info!("starting rt-5gms-af v{}", env!("CARGO_PKG_VERSION"));
    info!(config_path = %cli.config, endpoints = config.endpoints.len(), "configuration loaded");

    let cert_manager = Arc::new(ProcessCertificateManager::new(
        config.certificate_manager.clone(),
        Duration::from_secs(config.outbound_timeout_seconds),
    ));
    let (engine, handle) = Engine::new(config.clone(), cert_manager);
    tokio::spawn(engine.run());

    if let Err(e) = http::serve_all(handle, config).await {
        error!(error = %e, "http backend failed");
        return ExitCode::from(EXIT_BIND_FAILURE);
    }

    ExitCode::SUCCESS
}
