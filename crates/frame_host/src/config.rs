//! Configuration management for the frame host.
//!
//! Loads the TOML configuration, validates it, and converts it into the
//! options the bridge runtime takes.

use frame_bridge::{RuntimeOptions, Script};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

fn default_chat_poll_interval_ms() -> u64 {
    2000
}

fn default_persist_debounce_ms() -> u64 {
    1000
}

fn default_frame_name() -> String {
    "stdio".to_string()
}

fn default_sync_scope() -> String {
    "global".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub persistence: PersistenceSettings,
    #[serde(default)]
    pub scripts: ScriptSettings,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Bridge timing and the stdio frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// How often the observed chat scope is polled, in milliseconds
    #[serde(default = "default_chat_poll_interval_ms")]
    pub chat_poll_interval_ms: u64,
    /// Quiet period before state is saved, in milliseconds
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
    /// Name of the frame speaking over stdin/stdout
    #[serde(default = "default_frame_name")]
    pub frame_name: String,
    /// Variable scope the host logs changes of
    #[serde(default = "default_sync_scope")]
    pub sync_scope: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            chat_poll_interval_ms: default_chat_poll_interval_ms(),
            persist_debounce_ms: default_persist_debounce_ms(),
            frame_name: default_frame_name(),
            sync_scope: default_sync_scope(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// JSON file state is saved to; none keeps state in memory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptSettings {
    /// Global scripts provisioned at startup
    #[serde(default)]
    pub builtin: Vec<BuiltinScript>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinScript {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl From<&BuiltinScript> for Script {
    fn from(builtin: &BuiltinScript) -> Self {
        Script::new(builtin.name.clone(), builtin.content.clone())
            .with_id(builtin.id.clone())
            .enabled(builtin.enabled)
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration file is written at
    /// `path` and the defaults are returned.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Checks the configuration for values the host cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.bridge.chat_poll_interval_ms == 0 {
            return Err("bridge.chat_poll_interval_ms must be greater than 0".to_string());
        }

        if self.bridge.frame_name.trim().is_empty() {
            return Err("bridge.frame_name cannot be empty".to_string());
        }

        self.bridge.sync_scope.parse::<frame_bridge::VariableScope>()?;

        for script in &self.scripts.builtin {
            if script.id.trim().is_empty() || script.name.trim().is_empty() {
                return Err("Built-in scripts need a non-empty id and name".to_string());
            }
        }

        Ok(())
    }

    pub fn chat_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge.chat_poll_interval_ms)
    }

    pub fn state_file(&self) -> Option<PathBuf> {
        self.persistence.state_file.as_ref().map(PathBuf::from)
    }

    /// Converts into the options of the bridge runtime.
    pub fn to_runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            persist_debounce: Duration::from_millis(self.bridge.persist_debounce_ms),
            builtin_scripts: self.scripts.builtin.iter().map(Script::from).collect(),
        }
    }
}
