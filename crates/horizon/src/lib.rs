//! # Horizon Replication Host
//!
//! Runs a replication graph against a simulated world and simulated client
//! connections. Useful for load testing graph settings before they go into a
//! game server.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! horizon
//!
//! # Specify custom configuration
//! horizon --config production.toml
//!
//! # Override specific settings
//! horizon --tick-rate 60 --objects 20000 --clients 128 --log-level debug
//!
//! # JSON logging for production
//! horizon --json-logs
//! ```
//!
//! ## Configuration
//!
//! The host loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created. The
//! `[replication]` table is the graph configuration and accepts every
//! section of `horizon_repgraph::GraphConfig`.
//!
//! ## Signal Handling
//!
//! The host stops on SIGINT (Ctrl+C) or SIGTERM. A second signal exits
//! immediately.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod shutdown;
pub mod signals;
pub mod simulation;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Parses the command line, sets up logging and runs the application.
///
/// Exits the process with status 1 on startup or runtime errors.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings come from the file, so read it before anything logs.
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();
    args.apply_to(&mut config);

    if let Err(e) = logging::setup_logging(&config.logging, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }

    Ok(())
}

pub use config::{LoggingSettings, RegionSettings, ServerSettings};
pub use shutdown::ShutdownState;
pub use simulation::{SimTransport, SimWorld, Simulation};
