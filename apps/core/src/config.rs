//! Service settings read from the environment (and an optional `.env` file).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::ai::{AiServiceManager, AnthropicAdapter, GeminiAdapter, ManagerSettings, OpenAiCompatibleAdapter};
use crate::error::AppError;
use crate::keywords::KeywordEngine;
use crate::keywords::extractor::DEFAULT_CACHE_CAPACITY;
use crate::models::ModelConfig;

pub const ENV_MAX_RETRIES: &str = "PUBMED_INSIGHT_MAX_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "PUBMED_INSIGHT_RETRY_DELAY_MS";
pub const ENV_CACHE_TTL_SECS: &str = "PUBMED_INSIGHT_CACHE_TTL_SECS";
pub const ENV_KEYWORD_CACHE_SIZE: &str = "PUBMED_INSIGHT_KEYWORD_CACHE_SIZE";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "PUBMED_INSIGHT_REQUEST_TIMEOUT_SECS";

/// Provider API keys. Empty strings mean "not configured".
#[derive(Clone, Default, PartialEq)]
pub struct ProviderKeys {
    pub openai: String,
    pub deepseek: String,
    pub dashscope: String,
    pub anthropic: String,
    pub gemini: String,
}

// Keys stay out of logs and debug output.
impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |key: &str| if key.is_empty() { "<unset>" } else { "<set>" };
        f.debug_struct("ProviderKeys")
            .field("openai", &mask(&self.openai))
            .field("deepseek", &mask(&self.deepseek))
            .field("dashscope", &mask(&self.dashscope))
            .field("anthropic", &mask(&self.anthropic))
            .field("gemini", &mask(&self.gemini))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub manager: ManagerSettings,
    pub keyword_cache_size: usize,
    pub request_timeout_secs: u64,
    pub keys: ProviderKeys,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            manager: ManagerSettings::default(),
            keyword_cache_size: DEFAULT_CACHE_CAPACITY,
            request_timeout_secs: ModelConfig::default().timeout_secs,
            keys: ProviderKeys::default(),
        }
    }
}

impl ServiceSettings {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_retries = parse_or(read(ENV_MAX_RETRIES), ENV_MAX_RETRIES, defaults.manager.max_retries)?;
        if max_retries == 0 {
            return Err(AppError::Config(format!("{} must be at least 1", ENV_MAX_RETRIES)));
        }
        let retry_delay_ms = parse_or(
            read(ENV_RETRY_DELAY_MS),
            ENV_RETRY_DELAY_MS,
            defaults.manager.retry_delay.as_millis() as u64,
        )?;
        let cache_ttl_secs = parse_or(
            read(ENV_CACHE_TTL_SECS),
            ENV_CACHE_TTL_SECS,
            defaults.manager.cache_ttl.as_secs(),
        )?;
        let keyword_cache_size = parse_or(
            read(ENV_KEYWORD_CACHE_SIZE),
            ENV_KEYWORD_CACHE_SIZE,
            defaults.keyword_cache_size,
        )?;
        let request_timeout_secs = parse_or(
            read(ENV_REQUEST_TIMEOUT_SECS),
            ENV_REQUEST_TIMEOUT_SECS,
            defaults.request_timeout_secs,
        )?;

        let key = |name: &str| read(name).unwrap_or_default();
        Ok(Self {
            manager: ManagerSettings {
                max_retries,
                retry_delay: Duration::from_millis(retry_delay_ms),
                cache_ttl: Duration::from_secs(cache_ttl_secs),
            },
            keyword_cache_size,
            request_timeout_secs: request_timeout_secs.max(1),
            keys: ProviderKeys {
                openai: key("OPENAI_API_KEY"),
                deepseek: key("DEEPSEEK_API_KEY"),
                dashscope: key("DASHSCOPE_API_KEY"),
                anthropic: key("ANTHROPIC_API_KEY"),
                gemini: key("GEMINI_API_KEY"),
            },
        })
    }

    fn model_config(&self, api_key: &str) -> ModelConfig {
        ModelConfig {
            api_key: api_key.to_string(),
            timeout_secs: self.request_timeout_secs,
            ..ModelConfig::default()
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T, AppError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value '{}'", key, raw))),
    }
}

/// Creates a manager with all five provider adapters registered.
///
/// Every model starts unavailable; run a connection test (or apply a
/// trusted override) before generating.
pub async fn build_manager(settings: &ServiceSettings) -> AiServiceManager {
    let manager = AiServiceManager::new(settings.manager.clone());
    let keys = &settings.keys;

    manager
        .register_adapter(
            "openai",
            Arc::new(OpenAiCompatibleAdapter::openai(settings.model_config(&keys.openai))),
        )
        .await;
    manager
        .register_adapter(
            "deepseek",
            Arc::new(OpenAiCompatibleAdapter::deepseek(settings.model_config(&keys.deepseek))),
        )
        .await;
    manager
        .register_adapter(
            "qwen",
            Arc::new(OpenAiCompatibleAdapter::qwen(settings.model_config(&keys.dashscope))),
        )
        .await;
    manager
        .register_adapter(
            "anthropic",
            Arc::new(AnthropicAdapter::new(settings.model_config(&keys.anthropic))),
        )
        .await;
    manager
        .register_adapter(
            "gemini",
            Arc::new(GeminiAdapter::new(settings.model_config(&keys.gemini))),
        )
        .await;

    info!("AI service manager ready with {:?}", settings.keys);
    manager
}

pub fn build_keyword_engine(settings: &ServiceSettings) -> KeywordEngine {
    KeywordEngine::with_cache_capacity(settings.keyword_cache_size)
}
