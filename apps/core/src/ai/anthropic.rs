//! Adapter for the Anthropic Messages API.

use std::time::Instant;

use async_trait::async_trait;
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

const API_VERSION: &str = "2023-06-01";

pub static ANTHROPIC: ProviderProfile = ProviderProfile {
    provider: "Anthropic",
    default_base_url: "https://api.anthropic.com",
    default_model: "claude-3-5-sonnet-20241022",
    key_prefix: "sk-ant-",
    min_key_length: 20,
    supports_chinese: true,
    models: &[
        ModelSpec {
            id: "claude-3-5-sonnet",
            context_tokens: 200_000,
            pricing: Pricing {
                prompt_per_1k: 0.003,
                completion_per_1k: 0.015,
            },
        },
        ModelSpec {
            id: "claude-3-5-haiku",
            context_tokens: 200_000,
            pricing: Pricing {
                prompt_per_1k: 0.0008,
                completion_per_1k: 0.004,
            },
        },
        ModelSpec {
            id: "claude-3-opus",
            context_tokens: 200_000,
            pricing: Pricing {
                prompt_per_1k: 0.015,
                completion_per_1k: 0.075,
            },
        },
    ],
};

/// Request body for the Messages API.
#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    temperature: f32,
    top_p: f32,
    #[serde(flatten)]
    extra: &'a std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl MessagesResponse {
    /// Concatenated text of all text blocks.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Claude models through the Anthropic Messages API.
pub struct AnthropicAdapter {
    name: String,
    core: ProviderCore,
}

impl AnthropicAdapter {
    pub fn new(config: ModelConfig) -> Self {
        Self::with_name("anthropic", config)
    }

    pub fn with_name(name: &str, config: ModelConfig) -> Self {
        Self {
            name: name.to_string(),
            core: ProviderCore::new(&ANTHROPIC, config),
        }
    }

    async fn send(
        &self,
        client: &Client,
        config: &ModelConfig,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        ANTHROPIC.validate_key(&config.api_key)?;
        check_request(config, options)?;
        let params = EffectiveParams::resolve(config, options);

        let request = MessagesRequest {
            model: &config.model,
            max_tokens: params.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            system: options.system_prompt.as_deref(),
            temperature: params.temperature.min(1.0),
            top_p: params.top_p,
            extra: &config.extra,
        };

        let url = format!("{}/v1/messages", self.core.base_url(config));
        debug!("Anthropic request to {} (model {})", url, config.model);

        let response = client
            .post(&url)
            .header("x-api-key", config.api_key.trim())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &config.model, &body));
        }

        let body: MessagesResponse = response.json().await?;
        let text = body.text();
        if text.trim().is_empty() {
            return Err(AppError::InvalidResponse(
                "Anthropic returned no text content".to_string(),
            ));
        }

        let usage = match body.usage {
            Some(Usage {
                input_tokens: Some(input),
                output_tokens: Some(output),
            }) => TokenUsage::new(input, output),
            _ => TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&text)),
        };

        Ok(GenerationResult {
            cost: ANTHROPIC.cost(&config.model, &usage),
            model: body.model.unwrap_or_else(|| config.model.clone()),
            finish_reason: body.stop_reason,
            text,
            usage,
        })
    }
}

/// Maps Anthropic error types (`authentication_error`, `rate_limit_error`...) to a normalized failure.
fn classify(status: u16, model: &str, body: &str) -> AppError {
    let error = ErrorBody::parse(body);
    let message = error.message.to_ascii_lowercase();

    let kind = match (status, error.code.as_str()) {
        (401, _) | (_, "authentication_error") => FailureKind::InvalidKey,
        (403, _) | (_, "permission_error") => FailureKind::PermissionDenied,
        (404, _) | (_, "not_found_error") => FailureKind::ModelNotFound,
        (429, _) | (_, "rate_limit_error") => FailureKind::RateLimited,
        (529, _) | (_, "overloaded_error") => FailureKind::Overloaded,
        (400, _) if message.contains("credit balance") => FailureKind::QuotaExhausted,
        (400, _) => FailureKind::BadRequest,
        (500..=599, _) => FailureKind::Server,
        _ => FailureKind::Other,
    };
    provider_error(ANTHROPIC.provider, kind, status, model, &error.message)
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    fn provider(&self) -> &'static str {
        ANTHROPIC.provider
    }

    async fn model_info(&self) -> ModelInfo {
        ANTHROPIC.info(&self.name, &self.core.config().await)
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
            Err(err) => return failed_connection(&ANTHROPIC, "", None, &err),
        };
        if let Err(err) = ANTHROPIC.validate_key(&config.api_key) {
            return failed_connection(&ANTHROPIC, &config.model, None, &err);
        }

        let outcome = self.send(&client, &config, CONNECTION_TEST_PROMPT, &connection_test_options()).await;
        let result = connection_result(&ANTHROPIC, &config.model, started, outcome);
        info!("Connection test for {}: {}", self.name, result.message);
        result
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        let config = self.core.config().await;
        ANTHROPIC.validate_key(&config.api_key)?;
        let client = self.core.client().await?;
        self.send(&client, &config, prompt, options).await
    }

    async fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        ANTHROPIC.cost(&self.core.config().await.model, usage)
    }

    async fn calculate_flat_cost(&self, tokens: u32) -> f64 {
        ANTHROPIC.flat_cost(&self.core.config().await.model, tokens)
    }
}
