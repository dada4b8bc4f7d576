//! Adapter for OpenAI-style `/chat/completions` endpoints.
//!
//! OpenAI itself, DeepSeek and Qwen (DashScope compatible mode) share the
//! wire format and differ only in endpoint, key rule, model tables and a few
//! error codes.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::ai::analysis::estimate_tokens;
use crate::ai::provider::{
    check_request, connection_result, connection_test_options, failed_connection, provider_error,
    EffectiveParams, ErrorBody, FailureKind, ModelSpec, ProviderCore, ProviderProfile,
    CONNECTION_TEST_PROMPT,
};
use crate::ai::traits::ModelAdapter;
use crate::error::AppError;
use crate::models::{
    ConnectionTestResult, GenerationOptions, GenerationResult, ModelConfig, ModelConfigPatch,
    ModelInfo, Pricing, TokenUsage,
};

const fn spec(id: &'static str, context_tokens: u32, prompt_per_1k: f64, completion_per_1k: f64) -> ModelSpec {
    ModelSpec {
        id,
        context_tokens,
        pricing: Pricing {
            prompt_per_1k,
            completion_per_1k,
        },
    }
}

pub static OPENAI: ProviderProfile = ProviderProfile {
    provider: "OpenAI",
    default_base_url: "https://api.openai.com/v1",
    default_model: "gpt-4o-mini",
    key_prefix: "sk-",
    min_key_length: 20,
    supports_chinese: true,
    models: &[
        spec("gpt-4o", 128_000, 0.0025, 0.01),
        spec("gpt-4o-mini", 128_000, 0.00015, 0.0006),
        spec("gpt-4-turbo", 128_000, 0.01, 0.03),
        spec("gpt-3.5-turbo", 16_385, 0.0005, 0.0015),
    ],
};

pub static DEEPSEEK: ProviderProfile = ProviderProfile {
    provider: "DeepSeek",
    default_base_url: "https://api.deepseek.com/v1",
    default_model: "deepseek-chat",
    key_prefix: "sk-",
    min_key_length: 20,
    supports_chinese: true,
    models: &[
        spec("deepseek-chat", 64_000, 0.00014, 0.00028),
        spec("deepseek-reasoner", 64_000, 0.00055, 0.00219),
    ],
};

pub static QWEN: ProviderProfile = ProviderProfile {
    provider: "Qwen",
    default_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
    default_model: "qwen-plus",
    key_prefix: "sk-",
    min_key_length: 20,
    supports_chinese: true,
    models: &[
        spec("qwen-turbo", 131_072, 0.0003, 0.0006),
        spec("qwen-plus", 131_072, 0.0008, 0.002),
        spec("qwen-max", 32_768, 0.0024, 0.0096),
    ],
};

// --- Wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(flatten)]
    extra: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// Adapter for any OpenAI-compatible chat completion API.
pub struct OpenAiCompatibleAdapter {
    name: String,
    core: ProviderCore,
}

impl OpenAiCompatibleAdapter {
    pub fn new(name: &str, profile: &'static ProviderProfile, config: ModelConfig) -> Self {
        Self {
            name: name.to_string(),
            core: ProviderCore::new(profile, config),
        }
    }

    pub fn openai(config: ModelConfig) -> Self {
        Self::new("openai", &OPENAI, config)
    }

    pub fn deepseek(config: ModelConfig) -> Self {
        Self::new("deepseek", &DEEPSEEK, config)
    }

    pub fn qwen(config: ModelConfig) -> Self {
        Self::new("qwen", &QWEN, config)
    }

    async fn send(
        &self,
        client: &Client,
        config: &ModelConfig,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        let profile = self.core.profile;
        profile.validate_key(&config.api_key)?;
        check_request(config, options)?;

        let params = EffectiveParams::resolve(config, options);
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        let request = ChatRequest {
            model: &config.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            extra: &config.extra,
        };

        let url = format!("{}/chat/completions", self.core.base_url(config));
        debug!("{} request to {} (model {})", profile.provider, url, config.model);

        let response = client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", config.api_key.trim()))
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(profile, status, &config.model, &body));
        }

        let body: ChatResponse = response.json().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InvalidResponse(format!("{} returned no choices", profile.provider)))?;
        let text = choice
            .message
            .and_then(|m| m.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AppError::InvalidResponse(format!("{} returned an empty message", profile.provider)))?;

        let usage = match body.usage {
            Some(ChatUsage {
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(completion_tokens),
            }) => TokenUsage::new(prompt_tokens, completion_tokens),
            _ => TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&text)),
        };

        Ok(GenerationResult {
            cost: profile.cost(&config.model, &usage),
            model: body.model.unwrap_or_else(|| config.model.clone()),
            finish_reason: choice.finish_reason,
            text,
            usage,
        })
    }
}

/// Maps OpenAI-style status codes and error codes to a normalized failure.
fn classify(profile: &ProviderProfile, status: u16, model: &str, body: &str) -> AppError {
    let error = ErrorBody::parse(body);
    let code = error.code.to_ascii_lowercase();
    let message = error.message.to_ascii_lowercase();

    let kind = match status {
        401 => FailureKind::InvalidKey,
        _ if code == "invalid_api_key" || code == "invalidapikey" => FailureKind::InvalidKey,
        402 => FailureKind::QuotaExhausted,
        429 if code == "insufficient_quota" || message.contains("quota") || message.contains("balance") => {
            FailureKind::QuotaExhausted
        }
        429 => FailureKind::RateLimited,
        403 => FailureKind::PermissionDenied,
        404 => FailureKind::ModelNotFound,
        _ if code == "model_not_found" => FailureKind::ModelNotFound,
        400 => FailureKind::BadRequest,
        500..=599 => FailureKind::Server,
        _ => FailureKind::Other,
    };
    provider_error(profile.provider, kind, status, model, &error.message)
}

#[async_trait]
impl ModelAdapter for OpenAiCompatibleAdapter {
    fn provider(&self) -> &'static str {
        self.core.profile.provider
    }

    async fn model_info(&self) -> ModelInfo {
        self.core.profile.info(&self.name, &self.core.config().await)
    }

    async fn config(&self) -> ModelConfig {
        self.core.config().await
    }

    async fn update_config(&self, patch: ModelConfigPatch) -> Result<(), AppError> {
        self.core.update(patch).await
    }

    #[instrument(skip_all, fields(adapter = %self.name))]
    async fn test_connection(&self, config: Option<ModelConfig>) -> ConnectionTestResult {
        let started = Instant::now();
        let (config, client) = match self.core.connection_target(config).await {
            Ok(target) => target,
            Err(err) => return failed_connection(self.core.profile, "", None, &err),
        };
        if let Err(err) = self.core.profile.validate_key(&config.api_key) {
            return failed_connection(self.core.profile, &config.model, None, &err);
        }

        let outcome = self.send(&client, &config, CONNECTION_TEST_PROMPT, &connection_test_options()).await;
        let result = connection_result(self.core.profile, &config.model, started, outcome);
        info!("Connection test for {}: {}", self.name, result.message);
        result
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        let config = self.core.config().await;
        self.core.profile.validate_key(&config.api_key)?;
        let client = self.core.client().await?;
        self.send(&client, &config, prompt, options).await
    }

    async fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        self.core.profile.cost(&self.core.config().await.model, usage)
    }

    async fn calculate_flat_cost(&self, tokens: u32) -> f64 {
        self.core.profile.flat_cost(&self.core.config().await.model, tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "sk-test-0123456789abcdef";

    fn adapter_for(server: &MockServer) -> OpenAiCompatibleAdapter {
        OpenAiCompatibleAdapter::openai(ModelConfig {
            api_key: KEY.to_string(),
            base_url: Some(server.uri()),
            model: "gpt-4o-mini".to_string(),
            ..ModelConfig::default()
        })
    }

    #[tokio::test]
    async fn test_generate_text_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", format!("Bearer {}", KEY).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"message": {"role": "assistant", "content": "Vaccines work."}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 1000, "completion_tokens": 1000, "total_tokens": 2000}
            })))
            .mount(&mock_server)
            .await;

        let adapter = adapter_for(&mock_server);
        let result = adapter
            .generate_text("Do vaccines work?", &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(result.text, "Vaccines work.");
        assert_eq!(result.usage.total_tokens, 2000);
        assert_eq!(result.model, "gpt-4o-mini-2024-07-18");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert!((result.cost - (0.00015 + 0.0006)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_per_call_overrides_reach_request_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "temperature": 0.25,
                "max_tokens": 128,
                "top_p": 0.5,
                "frequency_penalty": 0.5,
                "presence_penalty": -0.5,
                "messages": [
                    {"role": "system", "content": "Answer in one line."},
                    {"role": "user", "content": "Define CRISPR"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "Gene editing."}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let options = GenerationOptions {
            temperature: Some(0.25),
            max_tokens: Some(128),
            top_p: Some(0.5),
            frequency_penalty: Some(0.5),
            presence_penalty: Some(-0.5),
            system_prompt: Some("Answer in one line.".to_string()),
            ..GenerationOptions::default()
        };
        let result = adapter_for(&mock_server)
            .generate_text("Define CRISPR", &options)
            .await
            .unwrap();
        assert_eq!(result.text, "Gene editing.");
    }

    #[tokio::test]
    async fn test_out_of_range_values_rejected_before_sending() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let adapter = adapter_for(&mock_server);
        let err = adapter
            .update_config(ModelConfigPatch {
                temperature: Some(9.5),
                max_tokens: Some(0),
                ..ModelConfigPatch::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{:?}", err);
        assert_eq!(adapter.config().await.temperature, 0.7);

        let hot = GenerationOptions {
            temperature: Some(9.5),
            ..GenerationOptions::default()
        };
        let err = adapter.generate_text("hi", &hot).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let result = adapter
            .test_connection(Some(ModelConfig {
                api_key: KEY.to_string(),
                base_url: Some(mock_server.uri()),
                presence_penalty: 3.0,
                ..ModelConfig::default()
            }))
            .await;
        assert!(!result.success);
        assert!(result.message.contains("Validation"), "{}", result.message);
    }

    #[tokio::test]
    async fn test_missing_usage_falls_back_to_estimate() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "abcdefgh"}, "finish_reason": "stop"}]
            })))
            .mount(&mock_server)
            .await;

        let adapter = adapter_for(&mock_server);
        let result = adapter
            .generate_text("abcd", &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(result.usage, TokenUsage::new(1, 2));
        assert_eq!(result.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_insufficient_quota_is_normalized() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "You exceeded your current quota", "type": "insufficient_quota", "code": "insufficient_quota"}
            })))
            .mount(&mock_server)
            .await;

        let err = adapter_for(&mock_server)
            .generate_text("hi", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Quota exhausted"), "{}", err);
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&mock_server)
            .await;

        let err = adapter_for(&mock_server)
            .generate_text("hi", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_connection_with_bad_key_never_hits_network() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let adapter = adapter_for(&mock_server);
        let result = adapter
            .test_connection(Some(ModelConfig {
                api_key: "pk-wrong".to_string(),
                base_url: Some(mock_server.uri()),
                ..ModelConfig::default()
            }))
            .await;

        assert!(!result.success);
        assert!(result.message.contains("must start with 'sk-'"));
        assert_eq!(result.model, "gpt-4o-mini");
    }

    #[test]
    fn test_deepseek_balance_error() {
        let err = classify(
            &DEEPSEEK,
            402,
            "deepseek-chat",
            r#"{"error": {"message": "Insufficient Balance", "type": "unknown_error"}}"#,
        );
        assert_eq!(
            err.to_string(),
            "DeepSeek error: Quota exhausted or insufficient account balance"
        );
    }

    #[test]
    fn test_qwen_invalid_key_code() {
        let err = classify(
            &QWEN,
            400,
            "qwen-plus",
            r#"{"error": {"code": "invalid_api_key", "message": "Incorrect API key provided."}}"#,
        );
        assert!(err.to_string().contains("Invalid API key"));
    }
}
