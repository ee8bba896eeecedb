//! Application configuration
//!
//! Storage locations, the model provider, pipeline bounds and logging.

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Embedded default configuration file
const DEFAULT_CONFIG: &str = include_str!("../../query-pilot.config.toml");

/// Configuration file name
const CONFIG_FILE_NAME: &str = "query-pilot.config.toml";

const KNOWN_PROVIDERS: &[&str] = &["mock", "openai"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from the first file found, or create a default one
    pub fn load() -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(CONFIG_FILE_NAME) {
            return Self::parse(&content, Path::new(CONFIG_FILE_NAME));
        }

        if let Some(base_dirs) = BaseDirs::new() {
            let home_config = base_dirs
                .home_dir()
                .join(".query-pilot")
                .join(CONFIG_FILE_NAME);
            if let Ok(content) = std::fs::read_to_string(&home_config) {
                return Self::parse(&content, &home_config);
            }
        }

        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            if let Ok(content) = std::fs::read_to_string(&config_path) {
                return Self::parse(&content, Path::new(&config_path));
            }
        }

        eprintln!(
            "No configuration file found. Creating {} with default settings...",
            CONFIG_FILE_NAME
        );
        if let Err(e) = std::fs::write(CONFIG_FILE_NAME, DEFAULT_CONFIG) {
            eprintln!("Warning: Could not create {}: {}", CONFIG_FILE_NAME, e);
            eprintln!("Continuing with default configuration in memory.");
        }
        Self::embedded_default()
    }

    /// Load configuration from a specific path, creating it from the default
    /// when it does not exist
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "Configuration file not found at {}. Creating with default settings...",
                    path.display()
                );
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory {}", parent.display()))?;
                }
                std::fs::write(path, DEFAULT_CONFIG)
                    .with_context(|| format!("Failed to create config file at {}", path.display()))?;
                Self::embedded_default()
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            )),
        }
    }

    /// The configuration shipped with the binary
    pub fn embedded_default() -> Result<Self> {
        toml::from_str(DEFAULT_CONFIG)
            .map_err(|e| anyhow::anyhow!("Failed to parse embedded default config: {}", e))
    }

    fn parse(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", origin.display(), e))
    }

    pub fn validate(&self) -> Result<()> {
        let provider = self.model.provider.to_lowercase();
        if provider.is_empty() {
            return Err(anyhow::anyhow!("Model provider cannot be empty"));
        }
        if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid model provider: {}",
                self.model.provider
            ));
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.model.temperature
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }

        if self.pipeline.max_retries == 0 {
            return Err(anyhow::anyhow!("pipeline.max_retries must be at least 1"));
        }
        if self.pipeline.conversation_window == 0 {
            return Err(anyhow::anyhow!(
                "pipeline.conversation_window must be at least 1"
            ));
        }
        if self.pipeline.history_capacity == 0 {
            return Err(anyhow::anyhow!("pipeline.history_capacity must be at least 1"));
        }

        Ok(())
    }

    /// Apply `QUERY_PILOT_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(provider) = var("QUERY_PILOT_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(model_name) = var("QUERY_PILOT_MODEL") {
            self.model.model_name = Some(model_name);
        }
        if let Some(source) = var("QUERY_PILOT_API_KEY_SOURCE") {
            self.model.api_key_source = Some(source);
        }
        if let Some(api_base) = var("QUERY_PILOT_API_BASE") {
            self.model.api_base = Some(api_base);
        }
        if let Some(level) = var("QUERY_PILOT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(db_path) = var("QUERY_PILOT_DB_PATH") {
            self.database.path = PathBuf::from(db_path);
        }
        if let Some(data_dir) = var("QUERY_PILOT_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }
        if let Some(retries) = var("QUERY_PILOT_MAX_RETRIES") {
            match retries.parse::<usize>() {
                Ok(n) => self.pipeline.max_retries = n,
                Err(_) => eprintln!("Ignoring invalid QUERY_PILOT_MAX_RETRIES: {}", retries),
            }
        }
    }

    pub fn summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str("Configuration loaded:\n");
        summary.push_str(&format!("Data Directory: {}\n", self.storage.data_dir.display()));
        summary.push_str(&format!("Database: {}\n", self.database.path.display()));
        summary.push_str(&format!("Model Provider: {}\n", self.model.provider));
        if let Some(model) = &self.model.model_name {
            summary.push_str(&format!("Model Name: {}\n", model));
        }
        if let Some(base) = &self.model.api_base {
            summary.push_str(&format!("API Base: {}\n", base));
        }
        summary.push_str(&format!("Temperature: {}\n", self.model.temperature));
        summary.push_str(&format!("Max Retries: {}\n", self.pipeline.max_retries));
        summary.push_str(&format!(
            "Conversation Window: {}\n",
            self.pipeline.conversation_window
        ));
        summary.push_str(&format!(
            "Timeouts: model {}s, query {}s\n",
            self.pipeline.model_timeout_secs, self.pipeline.query_timeout_secs
        ));
        summary.push_str(&format!("Logging Level: {}\n", self.logging.level));
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for memory, history and conversation files
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.query-pilot/data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the DuckDB file queries run against
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("payroll.duckdb"),
        }
    }
}

/// Model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name ("mock" or "openai")
    pub provider: String,
    #[serde(default)]
    pub model_name: Option<String>,
    /// `env:NAME`, `file:PATH`, or a bare environment variable name
    #[serde(default)]
    pub api_key_source: Option<String>,
    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model_name: None,
            api_key_source: None,
            api_base: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// Bounds for a single question-answering turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Total execution attempts per turn
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Prior messages included in the prompt
    #[serde(default = "default_conversation_window")]
    pub conversation_window: usize,
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Query log entries retained
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_true")]
    pub seed_default_memories: bool,
}

fn default_max_retries() -> usize {
    3
}

fn default_conversation_window() -> usize {
    10
}

fn default_model_timeout() -> u64 {
    120
}

fn default_query_timeout() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            conversation_window: default_conversation_window(),
            model_timeout_secs: default_model_timeout(),
            query_timeout_secs: default_query_timeout(),
            history_capacity: default_history_capacity(),
            seed_default_memories: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
