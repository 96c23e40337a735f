//! Main application logic and lifecycle management.
//!
//! The `Application` loads the configuration, builds the bridge runtime,
//! connects the stdio frame and serves it until stdin closes or a
//! termination signal arrives.

use crate::{
    cli::CliArgs,
    config::AppConfig,
    logging::display_banner,
    signals::{setup_signal_handlers, setup_signal_handlers_silent},
    stdio::{serve_lines, LineTransport},
};
use frame_bridge::{
    create_host_runtime, FrameId, HostRuntime, JsonFilePersistence, LogNotifier, LoggingLauncher, NoopPersistence,
    Persistence, VariableChange, VariableObserver, VariableScope, VariableSyncService,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info, warn};

/// Logs every change the sync service reports.
#[derive(Debug, Default)]
pub struct LogObserver;

impl VariableObserver for LogObserver {
    fn added(&self, change: &VariableChange) {
        info!("➕ [{}] {} = {}", change.scope, change.key, change.value);
    }

    fn removed(&self, change: &VariableChange) {
        info!("➖ [{}] {} (was {})", change.scope, change.key, change.value);
    }

    fn updated(&self, change: &VariableChange) {
        info!("🔄 [{}] {} = {}", change.scope, change.key, change.value);
    }
}

/// The frame host: configuration plus the runtime built from it.
pub struct Application {
    config: AppConfig,
    runtime: HostRuntime,
}

impl Application {
    /// Loads the configuration, applies CLI overrides, validates the result
    /// and builds the runtime.
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(state_file) = args.state_file {
            config.persistence.state_file = Some(state_file.to_string_lossy().to_string());
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();
        let runtime = Self::build_runtime(&config);
        Ok(Self { config, runtime })
    }

    /// Builds the runtime `config` describes.
    pub fn build_runtime(config: &AppConfig) -> HostRuntime {
        let persistence: Arc<dyn Persistence> = match config.state_file() {
            Some(path) => Arc::new(JsonFilePersistence::new(path)),
            None => Arc::new(NoopPersistence),
        };
        create_host_runtime(
            Arc::new(LogNotifier),
            persistence,
            |_| Arc::new(LoggingLauncher),
            config.to_runtime_options(),
        )
    }

    pub fn runtime(&self) -> &HostRuntime {
        &self.runtime
    }

    /// Serves the stdio frame until stdin closes or a signal arrives, then
    /// shuts everything down.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.log_configuration_summary();
        self.runtime.start().await?;

        let frame = FrameId::new(&self.config.bridge.frame_name);
        self.runtime
            .bridge()
            .connect_frame(frame.clone(), Arc::new(LineTransport::stdout()));

        let sync = VariableSyncService::new(
            Arc::clone(self.runtime.store()),
            Arc::new(LogObserver),
            self.config.chat_poll_interval(),
        );
        let scope: VariableScope = self.config.bridge.sync_scope.parse()?;
        sync.set_scope(scope).await;

        info!("✅ Frame host is now running!");
        info!("🪟 Frame '{}' is reading JSON lines from stdin", frame);
        info!("🛑 Press Ctrl+C or close stdin to shut down");

        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            served = serve_lines(stdin, &frame, &self.runtime, &sync) => match served {
                Ok(lines) => info!("📭 stdin closed after {} line(s)", lines),
                Err(e) => error!("❌ Failed to read stdin: {}", e),
            },
            signal = setup_signal_handlers() => {
                if let Err(e) = signal {
                    error!("Failed to set up signal handlers: {e}");
                }
            }
        }

        // A second signal skips the graceful path.
        tokio::spawn(async move {
            if let Err(e) = setup_signal_handlers_silent().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }
            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        info!("🛑 Beginning graceful shutdown...");
        sync.cleanup().await;
        let stats = self.runtime.bridge().stats();
        self.runtime.shutdown().await;

        info!("📊 Final Statistics:");
        info!("  - Requests dispatched: {}", stats.requests_dispatched);
        info!("  - Replies sent: {}", stats.replies_sent);
        info!("  - Handler failures: {}", stats.handler_failures);
        info!("  - Ignored messages: {}", stats.ignored_messages);
        info!("  - Notifications published: {}", stats.notifications_published);
        info!("✅ Frame host shutdown complete");
        Ok(())
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🪟 Frame name: {}", self.config.bridge.frame_name);
        info!("  ⏱️ Chat poll interval: {}ms", self.config.bridge.chat_poll_interval_ms);
        info!("  💾 Save debounce: {}ms", self.config.bridge.persist_debounce_ms);
        match &self.config.persistence.state_file {
            Some(path) => info!("  📂 State file: {}", path),
            None => info!("  📂 State file: none (in-memory only)"),
        }
        info!("  📜 Built-in scripts: {}", self.config.scripts.builtin.len());
    }
}
