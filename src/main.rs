//! wgveil: obfuscating UDP relay for WireGuard traffic
//!
//! This is the main entry point for the relay daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! wgveil
//!
//! # Run with custom configuration
//! wgveil -c /path/to/config.json
//!
//! # Validate a configuration without starting
//! wgveil -c /path/to/config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use wgveil::config::{create_default_config, load_config, Config};
use wgveil::relay::Server;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/wgveil/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("wgveil v{}", wgveil::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"wgveil v{}

Obfuscating UDP relay for WireGuard traffic.

USAGE:
    wgveil [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/wgveil/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Override the log filter (standard tracing syntax)

SIGNALS:
    SIGINT/SIGTERM          Graceful shutdown: sessions drain, sockets close
"#,
        wgveil::VERSION
    );
}

/// Initialize logging
///
/// Log level priority (highest to lowest):
/// 1. `RUST_LOG` environment variable
/// 2. Config file `log.level` setting
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wgveil={level}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        create_default_config(&args.config_path)
            .with_context(|| format!("failed to write {}", args.config_path.display()))?;
        println!("Wrote default configuration to {}", args.config_path.display());
        return Ok(());
    }

    let config = load_config(&args.config_path)
        .with_context(|| format!("failed to load {}", args.config_path.display()))?;

    if args.check_config {
        println!("Configuration OK: {} server(s)", config.servers.len());
        return Ok(());
    }

    init_logging(&config);

    info!("wgveil v{} starting", wgveil::VERSION);

    let mut servers: Vec<Arc<Server>> = Vec::with_capacity(config.servers.len());
    for server_config in config.servers {
        let server = Arc::new(
            Server::new(server_config).context("failed to build server from configuration")?,
        );
        if let Err(e) = server.start() {
            error!(server = %server.name(), error = %e, "Failed to start server");
            // Unwind the ones that already started before bailing out.
            for started in &servers {
                started.stop().await;
            }
            return Err(e.into());
        }
        servers.push(server);
    }

    wait_for_shutdown_signal().await?;

    info!("Shutdown signal received, stopping");
    for server in &servers {
        server.stop().await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for SIGINT")?;
        }
        _ = sigterm.recv() => {}
    }

    Ok(())
}
