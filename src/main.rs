use anyhow::{Context, Result};
use chip_gpio::config::{Config, DEFAULT_CONFIG_PATH};
use chip_gpio::daemon::Daemon;
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logger();

    // Parse command line arguments
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    info!("chip-gpio daemon starting...");
    info!("Loading configuration from: {}", config_path);

    let config = Config::from_file(&config_path)?;
    info!("Configuration loaded successfully");

    // Interrupt callbacks run on their own threads; this task only waits for signals
    let mut daemon = Daemon::new(config)?;

    // Setup signal handling via tokio
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to setup SIGHUP handler")?;

    info!("Daemon started successfully");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match Config::from_file(&config_path) {
                    Ok(new_config) => {
                        if let Err(e) = daemon.reload_config(new_config) {
                            error!("Reload failed, daemon keeps running: {:#}", e);
                        }
                    }
                    Err(e) => error!("Keeping current configuration: {:#}", e),
                }
            }
        }
    }

    daemon.shutdown();
    info!("chip-gpio daemon shutdown complete");
    Ok(())
}

fn init_logger() {
    // Use `env_logger` for logging. Systemd/journald will capture stdout/stderr.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}
