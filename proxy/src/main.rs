use clap::Parser;
use log::{error, info};
use proxy::config::ProxyConfig;
use proxy::orchestrator::Orchestrator;
use proxy::telemetry::{BatchOptions, Emitter};
use std::path::PathBuf;
use std::sync::Arc;

/// Main-method of the application.
/// Loads the configuration, then serves every configured proxy until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[command(author, version, about)]
    struct Args {
        /// Path to the TOML configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Log level (error, warn, info, debug, trace); overrides TRACE/DEBUG
        #[arg(short, long)]
        log_level: Option<String>,
    }

    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = ProxyConfig::load(&args.config)?;
    info!(
        "Loaded {} proxies from {}",
        config.proxies.len(),
        args.config.display()
    );

    let emitter = Arc::new(Emitter::from_config(
        config.influxdb.as_ref(),
        BatchOptions::default(),
    )?);
    if config.influxdb.is_none() {
        info!("No [influxdb] section, command telemetry is only logged");
    }

    let orchestrator = Orchestrator::new(config.mappings(), config.pacing.clone(), emitter);
    orchestrator.run(shutdown_signal()).await?;

    Ok(())
}

/// Sets up env_logger. `RUST_LOG` wins over everything else.
fn init_logging(level: Option<&str>) {
    let default_level = match level {
        Some(level) => level.to_string(),
        None if std::env::var_os("TRACE").is_some() => "trace".to_string(),
        None if std::env::var_os("DEBUG").is_some() => "debug".to_string(),
        None => "info".to_string(),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
