pub mod app_config;

pub use app_config::{
    AppConfig, DatabaseConfig, LoggingConfig, ModelConfig, PipelineConfig, StorageConfig,
};
