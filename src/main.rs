use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::signal;

use bt_mqtt_scanner::ble::BtleReceiver;
use bt_mqtt_scanner::config::LoggingConfig;
use bt_mqtt_scanner::{AppConfig, CaptureError, Manager};

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CAPTURE_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Options {
    /// Configuration file. Without it, config/scanner.toml,
    /// /etc/bt-mqtt-scanner/scanner.toml and
    /// ~/.config/bt-mqtt-scanner/scanner.toml are tried in order.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

/// `RUST_LOG`, when set, wins over the configured level.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let mut builder = if logging.timestamps {
        pretty_env_logger::formatted_timed_builder()
    } else {
        pretty_env_logger::formatted_builder()
    };
    let level = if verbose { "debug" } else { logging.level.as_str() };
    builder.parse_filters(&format!("{level},btleplug=warn,rumqttc=warn"));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received termination signal"),
    }
}

#[tokio::main]
async fn main() {
    let options = Options::parse();

    // The logger is configured from the file, so load errors go to stderr.
    let config = match AppConfig::load(options.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };
    init_logging(&config.logging, options.verbose);

    let receiver = Arc::new(BtleReceiver::new(config.scanner.adapter.clone()));
    let manager = Manager::new(config, receiver);

    match manager.run(shutdown_signal()).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) if why.is::<CaptureError>() => {
            error!("{}", why);
            std::process::exit(EXIT_CAPTURE_FAILED);
        }
        Err(why) => {
            error!("{:#}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
