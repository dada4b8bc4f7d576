//! Shared plumbing for provider adapters.
//!
//! Each adapter composes a [`ProviderCore`]: the live configuration, the
//! lazily built HTTP client, the provider's key rule and its model tables.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;
use validator::Validate;

use crate::error::AppError;
use crate::models::{
    ConnectionTestResult, GenerationOptions, GenerationResult, ModelConfig, ModelConfigPatch,
    ModelInfo, Pricing, TokenUsage,
};

/// Context limit and unit prices of one provider model.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub context_tokens: u32,
    pub pricing: Pricing,
}

/// Static description of a provider: endpoint, key rule and model tables.
///
/// Prices change over time; treat the tables as configuration data.
#[derive(Debug)]
pub struct ProviderProfile {
    pub provider: &'static str,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
    pub key_prefix: &'static str,
    pub min_key_length: usize,
    pub supports_chinese: bool,
    pub models: &'static [ModelSpec],
}

impl ProviderProfile {
    /// Looks up a model by exact id or by the longest table id it starts with
    /// (dated snapshots such as `claude-3-5-sonnet-20241022`), falling back to
    /// the default model.
    pub fn spec(&self, model: &str) -> ModelSpec {
        self.models
            .iter()
            .filter(|spec| model == spec.id || model.starts_with(spec.id))
            .max_by_key(|spec| spec.id.len())
            .or_else(|| self.models.iter().find(|spec| spec.id == self.default_model))
            .or_else(|| self.models.first())
            .copied()
            .unwrap_or(ModelSpec {
                id: self.default_model,
                context_tokens: 4096,
                pricing: Pricing {
                    prompt_per_1k: 0.0,
                    completion_per_1k: 0.0,
                },
            })
    }

    /// Rejects a missing key and keys violating the provider's format rule.
    pub fn validate_key(&self, api_key: &str) -> Result<(), AppError> {
        let key = api_key.trim();
        if key.is_empty() {
            return Err(AppError::Config(format!("{} API key is required", self.provider)));
        }
        if !key.starts_with(self.key_prefix) {
            return Err(AppError::Config(format!(
                "{} API key must start with '{}'",
                self.provider, self.key_prefix
            )));
        }
        if key.chars().count() < self.min_key_length {
            return Err(AppError::Config(format!(
                "{} API key looks too short (expected at least {} characters)",
                self.provider, self.min_key_length
            )));
        }
        Ok(())
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let pricing = self.spec(model).pricing;
        (usage.prompt_tokens as f64 / 1000.0) * pricing.prompt_per_1k
            + (usage.completion_tokens as f64 / 1000.0) * pricing.completion_per_1k
    }

    /// Flat per-token rate: the mean of prompt and completion prices.
    pub fn flat_cost(&self, model: &str, tokens: u32) -> f64 {
        let pricing = self.spec(model).pricing;
        let per_token = (pricing.prompt_per_1k + pricing.completion_per_1k) / 2.0 / 1000.0;
        tokens as f64 * per_token
    }

    pub fn info(&self, name: &str, config: &ModelConfig) -> ModelInfo {
        let spec = self.spec(&config.model);
        ModelInfo {
            name: name.to_string(),
            provider: self.provider.to_string(),
            model: config.model.clone(),
            max_tokens: spec.context_tokens,
            supports_chinese: self.supports_chinese,
            pricing: spec.pricing,
        }
    }
}

/// Generation parameters after layering call overrides over stored defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl EffectiveParams {
    pub fn resolve(config: &ModelConfig, options: &GenerationOptions) -> Self {
        Self {
            temperature: options.temperature.unwrap_or(config.temperature),
            max_tokens: options.max_tokens.unwrap_or(config.max_tokens),
            top_p: options.top_p.unwrap_or(config.top_p),
            frequency_penalty: options.frequency_penalty.unwrap_or(config.frequency_penalty),
            presence_penalty: options.presence_penalty.unwrap_or(config.presence_penalty),
        }
    }
}

struct CoreState {
    config: ModelConfig,
    client: Option<Client>,
}

/// Live configuration plus the lazily built HTTP client of one adapter.
pub struct ProviderCore {
    pub profile: &'static ProviderProfile,
    state: RwLock<CoreState>,
}

impl ProviderCore {
    pub fn new(profile: &'static ProviderProfile, mut config: ModelConfig) -> Self {
        if config.model.trim().is_empty() {
            config.model = profile.default_model.to_string();
        }
        Self {
            profile,
            state: RwLock::new(CoreState {
                config,
                client: None,
            }),
        }
    }

    pub async fn config(&self) -> ModelConfig {
        self.state.read().await.config.clone()
    }

    /// Merges `patch` into the live config. A patch that would leave the
    /// config invalid is rejected and the previous config stays in place.
    pub async fn update(&self, patch: ModelConfigPatch) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let mut merged = state.config.clone();
        let reconnect = merged.merge(patch);
        if let Err(err) = check_config(&merged) {
            warn!("Rejected {} config update: {}", self.profile.provider, err);
            return Err(err);
        }

        state.config = merged;
        if reconnect {
            debug!("{} connectivity settings changed, dropping HTTP client", self.profile.provider);
            state.client = None;
        }
        Ok(())
    }

    /// Returns the cached client, building it on first use.
    pub async fn client(&self) -> Result<Client, AppError> {
        if let Some(client) = self.state.read().await.client.clone() {
            return Ok(client);
        }
        let mut state = self.state.write().await;
        if let Some(client) = state.client.clone() {
            return Ok(client);
        }
        let client = build_client(state.config.timeout_secs)?;
        state.client = Some(client.clone());
        Ok(client)
    }

    /// Config and client for a connection test, honouring an override config.
    pub async fn connection_target(
        &self,
        config: Option<ModelConfig>,
    ) -> Result<(ModelConfig, Client), AppError> {
        match config {
            Some(mut config) => {
                if config.model.trim().is_empty() {
                    config.model = self.profile.default_model.to_string();
                }
                check_config(&config)?;
                let client = build_client(config.timeout_secs)?;
                Ok((config, client))
            }
            None => Ok((self.config().await, self.client().await?)),
        }
    }

    pub fn base_url(&self, config: &ModelConfig) -> String {
        config
            .base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or(self.profile.default_base_url)
            .trim_end_matches('/')
            .to_string()
    }
}

/// Range checks on the generation parameters plus an http(s) base URL.
pub fn check_config(config: &ModelConfig) -> Result<(), AppError> {
    config.validate()?;
    if let Some(raw) = config.base_url.as_deref().filter(|url| !url.trim().is_empty()) {
        let url = Url::parse(raw.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "Base URL must use http or https, got '{}'",
                url.scheme()
            )));
        }
    }
    Ok(())
}

/// Checked before every provider request.
pub fn check_request(config: &ModelConfig, options: &GenerationOptions) -> Result<(), AppError> {
    check_config(config)?;
    options.validate()?;
    Ok(())
}

pub fn build_client(timeout_secs: u64) -> Result<Client, AppError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

/// Options for the minimal-cost call of a connection test.
pub fn connection_test_options() -> GenerationOptions {
    GenerationOptions {
        max_tokens: Some(5),
        temperature: Some(0.0),
        ..GenerationOptions::default()
    }
}

pub const CONNECTION_TEST_PROMPT: &str = "Hello";

/// Turns the outcome of that call into a connection test result.
pub fn connection_result(
    profile: &ProviderProfile,
    model: &str,
    started: Instant,
    outcome: Result<GenerationResult, AppError>,
) -> ConnectionTestResult {
    let latency_ms = Some(started.elapsed().as_millis() as u64);
    match outcome {
        Ok(_) => ConnectionTestResult {
            success: true,
            message: format!("Connected to {} ({})", profile.provider, model),
            provider: profile.provider.to_string(),
            model: model.to_string(),
            latency_ms,
        },
        Err(err) => failed_connection(profile, model, latency_ms, &err),
    }
}

pub fn failed_connection(
    profile: &ProviderProfile,
    model: &str,
    latency_ms: Option<u64>,
    err: &AppError,
) -> ConnectionTestResult {
    ConnectionTestResult {
        success: false,
        message: err.to_string(),
        provider: profile.provider.to_string(),
        model: model.to_string(),
        latency_ms,
    }
}

// --- Provider failure normalization ---

/// Normalized category of a provider rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidKey,
    QuotaExhausted,
    RateLimited,
    PermissionDenied,
    ModelNotFound,
    Overloaded,
    BadRequest,
    Server,
    Other,
}

/// Code and message pulled out of a provider error body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    /// Reads `error.{code,type,status,message}` (OpenAI, Anthropic and Google
    /// shapes) and falls back to the raw body as message.
    pub fn parse(body: &str) -> Self {
        let json: Value = match serde_json::from_str(body) {
            Ok(json) => json,
            Err(_) => {
                return Self {
                    code: String::new(),
                    message: body.trim().to_string(),
                }
            }
        };

        let error = json.get("error").unwrap_or(&json);
        let as_text = |v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        let code = ["code", "type", "status"]
            .iter()
            .filter_map(|field| error.get(*field).and_then(as_text))
            .find(|code| !code.is_empty())
            .unwrap_or_default();
        let message = error
            .get("message")
            .and_then(as_text)
            .unwrap_or_else(|| body.trim().to_string());

        Self { code, message }
    }
}

/// Builds the user-facing error for a classified provider failure.
pub fn provider_error(
    provider: &str,
    kind: FailureKind,
    status: u16,
    model: &str,
    detail: &str,
) -> AppError {
    let message = match kind {
        FailureKind::InvalidKey => "Invalid API key, check the key and try again".to_string(),
        FailureKind::QuotaExhausted => "Quota exhausted or insufficient account balance".to_string(),
        FailureKind::RateLimited => "Rate limit reached, wait a moment and retry".to_string(),
        FailureKind::PermissionDenied => {
            "Permission denied, the key cannot access this model".to_string()
        }
        FailureKind::ModelNotFound => format!("Model '{}' not found", model),
        FailureKind::Overloaded => "Service overloaded, try again later".to_string(),
        FailureKind::BadRequest => format!("Request rejected: {}", detail),
        FailureKind::Server => format!("Service unavailable (status {})", status),
        FailureKind::Other => format!("Request failed with status {}: {}", status, detail),
    };
    AppError::provider(provider, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_PROFILE: ProviderProfile = ProviderProfile {
        provider: "Test",
        default_base_url: "https://api.test.example/v1/",
        default_model: "base",
        key_prefix: "tk-",
        min_key_length: 10,
        supports_chinese: true,
        models: &[
            ModelSpec {
                id: "base",
                context_tokens: 8000,
                pricing: Pricing {
                    prompt_per_1k: 0.001,
                    completion_per_1k: 0.002,
                },
            },
            ModelSpec {
                id: "base-mini",
                context_tokens: 4000,
                pricing: Pricing {
                    prompt_per_1k: 0.0001,
                    completion_per_1k: 0.0002,
                },
            },
        ],
    };

    #[test]
    fn test_spec_prefers_longest_prefix() {
        assert_eq!(TEST_PROFILE.spec("base-mini-2024").id, "base-mini");
        assert_eq!(TEST_PROFILE.spec("base-2024").id, "base");
        assert_eq!(TEST_PROFILE.spec("unknown").id, "base");
    }

    #[test]
    fn test_key_rules() {
        assert!(matches!(TEST_PROFILE.validate_key(""), Err(AppError::Config(_))));
        assert!(matches!(TEST_PROFILE.validate_key("xx-1234567890"), Err(AppError::Config(_))));
        assert!(matches!(TEST_PROFILE.validate_key("tk-12"), Err(AppError::Config(_))));
        assert!(TEST_PROFILE.validate_key("tk-1234567890").is_ok());
    }

    #[test]
    fn test_cost_uses_split_prices() {
        let cost = TEST_PROFILE.cost("base", &TokenUsage::new(1000, 500));
        assert!((cost - (0.001 + 0.001)).abs() < 1e-12);

        let flat = TEST_PROFILE.flat_cost("base", 2000);
        assert!((flat - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_error_body_shapes() {
        let openai = ErrorBody::parse(
            r#"{"error": {"message": "Incorrect API key", "type": "invalid_request_error", "code": "invalid_api_key"}}"#,
        );
        assert_eq!(openai.code, "invalid_api_key");
        assert_eq!(openai.message, "Incorrect API key");

        let google = ErrorBody::parse(
            r#"{"error": {"code": 403, "message": "denied", "status": "PERMISSION_DENIED"}}"#,
        );
        assert_eq!(google.code, "403");

        let raw = ErrorBody::parse("Bad Gateway");
        assert_eq!(raw.code, "");
        assert_eq!(raw.message, "Bad Gateway");
    }

    #[tokio::test]
    async fn test_core_drops_client_on_connectivity_change() {
        let core = ProviderCore::new(&TEST_PROFILE, ModelConfig::default());
        assert_eq!(core.config().await.model, "base");
        core.client().await.unwrap();
        assert!(core.state.read().await.client.is_some());

        core.update(ModelConfigPatch {
            temperature: Some(0.1),
            ..ModelConfigPatch::default()
        })
        .await
        .unwrap();
        assert!(core.state.read().await.client.is_some());

        core.update(ModelConfigPatch {
            api_key: Some("tk-new-key-123".to_string()),
            ..ModelConfigPatch::default()
        })
        .await
        .unwrap();
        assert!(core.state.read().await.client.is_none());
    }

    #[tokio::test]
    async fn test_invalid_patch_keeps_previous_config() {
        let core = ProviderCore::new(&TEST_PROFILE, ModelConfig::default());
        core.client().await.unwrap();

        let err = core
            .update(ModelConfigPatch {
                api_key: Some("tk-other-key-456".to_string()),
                temperature: Some(9.5),
                max_tokens: Some(0),
                ..ModelConfigPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{:?}", err);

        let config = core.config().await;
        assert_eq!(config, ModelConfig { model: "base".to_string(), ..ModelConfig::default() });
        assert!(core.state.read().await.client.is_some());
    }

    #[tokio::test]
    async fn test_base_url_must_parse() {
        let core = ProviderCore::new(&TEST_PROFILE, ModelConfig::default());
        let err = core
            .update(ModelConfigPatch {
                base_url: Some("not a url".to_string()),
                ..ModelConfigPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(ref m) if m.starts_with("URL parse error")), "{:?}", err);

        let err = core
            .update(ModelConfigPatch {
                base_url: Some("ftp://files.example.com".to_string()),
                ..ModelConfigPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(core.config().await.base_url, None);
    }

    #[tokio::test]
    async fn test_override_config_is_checked_before_connecting() {
        let core = ProviderCore::new(&TEST_PROFILE, ModelConfig::default());
        let override_config = ModelConfig {
            top_p: 1.5,
            ..ModelConfig::default()
        };
        let err = core.connection_target(Some(override_config)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_request_options_are_range_checked() {
        let config = ModelConfig {
            model: "base".to_string(),
            ..ModelConfig::default()
        };
        assert!(check_request(&config, &GenerationOptions::default()).is_ok());

        let hot = GenerationOptions {
            temperature: Some(9.5),
            ..GenerationOptions::default()
        };
        assert!(matches!(check_request(&config, &hot), Err(AppError::Validation(_))));

        let empty = GenerationOptions {
            max_tokens: Some(0),
            ..GenerationOptions::default()
        };
        assert!(check_request(&config, &empty).is_err());
    }

    #[test]
    fn test_base_url_override_and_trailing_slash() {
        let core = ProviderCore::new(&TEST_PROFILE, ModelConfig::default());
        let mut config = ModelConfig::default();
        assert_eq!(core.base_url(&config), "https://api.test.example/v1");
        config.base_url = Some("http://127.0.0.1:9000/".to_string());
        assert_eq!(core.base_url(&config), "http://127.0.0.1:9000");
    }
}
