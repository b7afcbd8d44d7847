//! Portcullis CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use portcullis_config::load_config;
use portcullis_runtime::{ServerBuilder, SignalHandler};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "portcullis")]
#[command(about = "Portcullis reverse-proxy gateway", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the gateway (start the server)
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "portcullis.yaml", env = "PORTCULLIS_CONFIG")]
        config: PathBuf,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "portcullis.yaml", env = "PORTCULLIS_CONFIG")]
        config: PathBuf,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            log_level,
            log_format,
        } => {
            init_tracing(&log_level, log_format)?;

            tracing::info!("Starting Portcullis gateway");
            tracing::info!("Config file: {}", config.display());

            let config = load_config(&config)
                .with_context(|| format!("loading {}", config.display()))?;

            tracing::info!(
                listen = %config.gateway.listen,
                upstream = %config.upstream.target,
                plugins = config.plugins.len(),
                "Configuration loaded"
            );

            let server = ServerBuilder::new().config(config).build()?;

            let shutdown_signal = server.shutdown_signal();
            tokio::spawn(async move {
                let handler = SignalHandler::new(shutdown_signal);
                handler.run().await;
            });

            server.run().await?;
            Ok(())
        }

        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("Configuration is valid");
                    tracing::info!("  Listen: {}", cfg.gateway.listen);
                    tracing::info!("  Upstream: {}", cfg.upstream.target);
                    tracing::info!("  Redirect rules: {}", cfg.rules.redirect_dir.display());
                    tracing::info!("  Block rules: {}", cfg.rules.block_dir.display());
                    tracing::info!("  Plugins: {}", cfg.plugins.len());
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Portcullis gateway");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(filter.into())
        .add_directive("hyper=warn".parse()?);

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_level(true),
            )
            .with(env_filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .with(env_filter)
            .init(),
    }

    Ok(())
}
