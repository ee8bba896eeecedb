use query_pilot::config::{AppConfig, PipelineConfig};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const OVERRIDE_VARS: &[&str] = &[
    "QUERY_PILOT_PROVIDER",
    "QUERY_PILOT_MODEL",
    "QUERY_PILOT_LOG_LEVEL",
    "QUERY_PILOT_DB_PATH",
    "QUERY_PILOT_DATA_DIR",
    "QUERY_PILOT_MAX_RETRIES",
];

fn clear_overrides() {
    for var in OVERRIDE_VARS {
        env::remove_var(var);
    }
}

#[test]
fn loads_full_fixture() {
    let config = AppConfig::load_from_file(Path::new("tests/fixtures/config/valid_openai.toml")).unwrap();

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_name.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(config.model.temperature, 0.2);
    assert_eq!(config.model.max_tokens, Some(1024));
    assert_eq!(config.database.path, PathBuf::from("analytics.duckdb"));
    assert_eq!(config.pipeline.max_retries, 5);
    assert_eq!(config.pipeline.conversation_window, 6);
    // unspecified pipeline values keep their defaults
    assert_eq!(config.pipeline.history_capacity, 1000);
    assert_eq!(config.pipeline.query_timeout_secs, 30);
    assert_eq!(config.logging.level, "debug");
    assert!(config.validate().is_ok());
}

#[test]
fn invalid_values_fail_validation() {
    let provider =
        AppConfig::load_from_file(Path::new("tests/fixtures/config/invalid_provider.toml")).unwrap();
    let err = provider.validate().unwrap_err();
    assert!(err.to_string().contains("carrier-pigeon"));

    let temperature =
        AppConfig::load_from_file(Path::new("tests/fixtures/config/invalid_temperature.toml"))
            .unwrap();
    assert!(temperature.validate().is_err());
}

#[test]
fn malformed_toml_is_reported_with_its_path() {
    let err = AppConfig::load_from_file(Path::new("tests/fixtures/config/malformed.toml"))
        .unwrap_err();
    assert!(err.to_string().contains("malformed.toml"));
}

#[test]
fn missing_file_is_created_from_embedded_default() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("query-pilot.config.toml");

    let config = AppConfig::load_from_file(&path).unwrap();
    assert!(path.exists());
    assert_eq!(config.model.provider, "mock");
    assert_eq!(config.pipeline, PipelineConfig::default());
}

#[test]
#[serial]
fn environment_overrides_apply() {
    clear_overrides();
    env::set_var("QUERY_PILOT_PROVIDER", "openai");
    env::set_var("QUERY_PILOT_MODEL", "gpt-4o");
    env::set_var("QUERY_PILOT_LOG_LEVEL", "warn");
    env::set_var("QUERY_PILOT_DB_PATH", "/data/other.duckdb");
    env::set_var("QUERY_PILOT_DATA_DIR", "/data/pilot");
    env::set_var("QUERY_PILOT_MAX_RETRIES", "4");

    let mut config = AppConfig::embedded_default().unwrap();
    config.apply_env_overrides();
    clear_overrides();

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_name.as_deref(), Some("gpt-4o"));
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.database.path, PathBuf::from("/data/other.duckdb"));
    assert_eq!(config.storage.data_dir, PathBuf::from("/data/pilot"));
    assert_eq!(config.pipeline.max_retries, 4);
}

#[test]
#[serial]
fn invalid_numeric_override_is_ignored() {
    clear_overrides();
    env::set_var("QUERY_PILOT_MAX_RETRIES", "lots");

    let mut config = AppConfig::embedded_default().unwrap();
    config.apply_env_overrides();
    clear_overrides();

    assert_eq!(config.pipeline.max_retries, 3);
}

#[test]
fn summary_names_key_settings() {
    let config = AppConfig::embedded_default().unwrap();
    let summary = config.summary();
    assert!(summary.contains("Model Provider: mock"));
    assert!(summary.contains("Max Retries: 3"));
    assert!(summary.contains("Conversation Window: 10"));
}
