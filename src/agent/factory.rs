//! Provider factory
//!
//! Builds a model provider from `[model]` configuration.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::agent::model::{ModelProvider, ProviderKind};
use crate::agent::providers::MockProvider;
#[cfg(feature = "openai")]
use crate::agent::providers::OpenAIProvider;
use crate::config::ModelConfig;

#[cfg(feature = "openai")]
const DEFAULT_KEY_VAR: &str = "OPENAI_API_KEY";

pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn ModelProvider>> {
    let kind = ProviderKind::from_str(&config.provider)
        .ok_or_else(|| anyhow!("Unknown provider: {}", config.provider))?;

    match kind {
        ProviderKind::Mock => {
            let mut provider = MockProvider::default();
            if let Some(model_name) = &config.model_name {
                provider = provider.with_model_name(model_name.clone());
            }
            Ok(Arc::new(provider))
        }

        #[cfg(feature = "openai")]
        ProviderKind::OpenAI => {
            let api_key = match &config.api_key_source {
                Some(source) => resolve_api_key(source)?,
                None => load_api_key_from_env(DEFAULT_KEY_VAR)?,
            };
            let mut provider = match &config.api_base {
                Some(base) => OpenAIProvider::with_endpoint(api_key, base.clone()),
                None => OpenAIProvider::with_api_key(api_key),
            };
            if let Some(model_name) = &config.model_name {
                provider = provider.with_model(model_name.clone());
            }
            Ok(Arc::new(provider))
        }
    }
}

/// Resolve an API key source:
/// - `env:VAR_NAME` reads an environment variable
/// - `file:PATH` reads a file, trimmed
/// - anything else is taken as an environment variable name
pub fn resolve_api_key(source: &str) -> Result<String> {
    if let Some(env_var) = source.strip_prefix("env:") {
        load_api_key_from_env(env_var)
    } else if let Some(path) = source.strip_prefix("file:") {
        load_api_key_from_file(path)
    } else {
        load_api_key_from_env(source)
    }
}

pub fn load_api_key_from_env(env_var: &str) -> Result<String> {
    std::env::var(env_var).with_context(|| format!("Environment variable {} not set", env_var))
}

pub fn load_api_key_from_file(path: &str) -> Result<String> {
    let expanded = crate::persistence::expand_tilde(std::path::Path::new(path))?;
    std::fs::read_to_string(&expanded)
        .with_context(|| format!("Failed to read API key from file: {}", path))
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;

    #[test]
    fn creates_mock_provider() {
        let config = ModelConfig {
            model_name: Some("test-model".to_string()),
            ..ModelConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.kind(), ProviderKind::Mock);
        assert_eq!(provider.metadata().supported_models, vec!["test-model"]);
    }

    #[test]
    fn rejects_unknown_provider() {
        let config = ModelConfig {
            provider: "unknown-provider".to_string(),
            ..ModelConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[test]
    fn resolves_prefixed_and_bare_env_sources() {
        let _guard = env_lock();
        unsafe {
            std::env::set_var("QUERY_PILOT_TEST_KEY", "env-key-value");
        }
        assert_eq!(resolve_api_key("env:QUERY_PILOT_TEST_KEY").unwrap(), "env-key-value");
        assert_eq!(resolve_api_key("QUERY_PILOT_TEST_KEY").unwrap(), "env-key-value");
        unsafe {
            std::env::remove_var("QUERY_PILOT_TEST_KEY");
        }
        assert!(resolve_api_key("env:QUERY_PILOT_TEST_KEY").is_err());
    }

    #[test]
    fn resolves_file_source_trimmed() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "  file-api-key  ").unwrap();

        let key = resolve_api_key(&format!("file:{}", path.display())).unwrap();
        assert_eq!(key, "file-api-key");
    }
}
