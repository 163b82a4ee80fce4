//! a55d main entry point
//!
//! Loads the configuration, installs the shutdown handler and runs the
//! daemon until it is stopped or hits a fatal error.

use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use a55d_lib::{load_config, Daemon, DaemonConfig};
use log::{error, info};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    info!("a55d starting up");

    // Configuration file is optional; deployed defaults apply without one
    let config = match env::args().nth(1) {
        Some(path) => match load_config(&path) {
            Ok(config) => {
                info!("Configuration loaded from {}", path);
                config
            }
            Err(e) => {
                error!("Error loading configuration {}: {}", path, e);
                process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };
    info!(
        "Command channel {}, shared region {}, sockets {} / {}",
        config.tty_device.display(),
        config.dma_device.display(),
        config.command_socket.display(),
        config.event_socket.display()
    );

    let mut daemon = Daemon::new(config);

    // Set up signal handler for graceful shutdown
    ctrlc_handler(daemon.running_flag());

    if let Err(e) = daemon.run() {
        error!("a55d terminated: {}", e);
        process::exit(1);
    }

    info!("a55d shutdown complete");
}

/// Set up Ctrl+C / SIGTERM handler for graceful shutdown
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }
}
