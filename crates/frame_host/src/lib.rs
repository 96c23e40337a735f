//! # Frame Host - Main Entry Point
//!
//! Runs a frame bridge host for a single frame that speaks JSON lines over
//! stdin and stdout. This entry point handles CLI parsing, configuration
//! loading, and application lifecycle management.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! frame_host
//!
//! # Specify custom configuration
//! frame_host --config production.toml
//!
//! # Persist state and log in JSON
//! frame_host --state-file state.json --json-logs
//! ```
//!
//! ## Protocol
//!
//! Every stdin line holding a JSON object is a message from the frame;
//! replies and notifications are written to stdout one per line. Lines
//! starting with `/` are host commands (`/stats`, `/scripts`, `/chat`, ...)
//! that simulate what the embedding application would do. Logs go to
//! stderr.
//!
//! ## Signal Handling
//!
//! The host shuts down gracefully on SIGINT (Ctrl+C), SIGTERM (Unix
//! systems), or when stdin closes.

use tracing::error;

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod signals;
pub mod stdio;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Runs the frame host until shutdown.
///
/// # Exit Codes
///
/// * **0**: Successful execution and shutdown
/// * **1**: Error during startup, configuration, or runtime
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Logging settings come from the file before CLI overrides are applied
    let config = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default();

    let mut logging_settings = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging_settings.level = level.clone();
    }
    if let Err(e) = logging::setup_logging(&logging_settings, args.json_logs) {
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

pub use config::{BridgeSettings, BuiltinScript, LoggingSettings, PersistenceSettings, ScriptSettings};
pub use stdio::{parse_command, serve_lines, HostCommand, LineTransport};
