//! Adapter for Google Gemini `generateContent`.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
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

pub static GEMINI: ProviderProfile = ProviderProfile {
    provider: "Gemini",
    default_base_url: "https://generativelanguage.googleapis.com/v1beta",
    default_model: "gemini-1.5-flash",
    key_prefix: "AIza",
    min_key_length: 30,
    supports_chinese: true,
    models: &[
        ModelSpec {
            id: "gemini-1.5-pro",
            context_tokens: 2_000_000,
            pricing: Pricing {
                prompt_per_1k: 0.00125,
                completion_per_1k: 0.005,
            },
        },
        ModelSpec {
            id: "gemini-1.5-flash",
            context_tokens: 1_000_000,
            pricing: Pricing {
                prompt_per_1k: 0.000075,
                completion_per_1k: 0.0003,
            },
        },
        ModelSpec {
            id: "gemini-2.0-flash",
            context_tokens: 1_000_000,
            pricing: Pricing {
                prompt_per_1k: 0.0001,
                completion_per_1k: 0.0004,
            },
        },
    ],
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: Value,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// `generationConfig` with the extras bag merged on top.
fn generation_config(config: &ModelConfig, params: &EffectiveParams) -> Value {
    let mut map = Map::new();
    map.insert("temperature".into(), params.temperature.into());
    map.insert("maxOutputTokens".into(), params.max_tokens.into());
    map.insert("topP".into(), params.top_p.into());
    // Some Gemini models reject penalty fields, so neutral values stay unset.
    if params.frequency_penalty != 0.0 {
        map.insert("frequencyPenalty".into(), params.frequency_penalty.into());
    }
    if params.presence_penalty != 0.0 {
        map.insert("presencePenalty".into(), params.presence_penalty.into());
    }
    for (key, value) in &config.extra {
        map.insert(key.clone(), value.clone());
    }
    Value::Object(map)
}

pub struct GeminiAdapter {
    name: String,
    core: ProviderCore,
}

impl GeminiAdapter {
    pub fn new(config: ModelConfig) -> Self {
        Self::with_name("gemini", config)
    }

    pub fn with_name(name: &str, config: ModelConfig) -> Self {
        Self {
            name: name.to_string(),
            core: ProviderCore::new(&GEMINI, config),
        }
    }

    async fn send(
        &self,
        client: &Client,
        config: &ModelConfig,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        GEMINI.validate_key(&config.api_key)?;
        check_request(config, options)?;
        let params = EffectiveParams::resolve(config, options);

        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part { text: prompt }],
            }],
            system_instruction: options.system_prompt.as_deref().map(|text| Content {
                role: None,
                parts: vec![Part { text }],
            }),
            generation_config: generation_config(config, &params),
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.core.base_url(config),
            config.model
        );
        debug!("Gemini request to {}", url);

        let response = client
            .post(&url)
            .header("x-goog-api-key", config.api_key.trim())
            .json(&request)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &config.model, &body));
        }

        let body: GenerateResponse = response.json().await?;
        if let Some(reason) = body.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(AppError::InvalidResponse(format!(
                "Gemini blocked the prompt: {}",
                reason
            )));
        }

        let candidate = body.candidates.into_iter().next().ok_or_else(|| {
            AppError::InvalidResponse("Gemini returned no candidates".to_string())
        })?;
        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AppError::InvalidResponse(format!(
                "Gemini returned an empty candidate (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            )));
        }

        let usage = match body.usage_metadata {
            Some(UsageMetadata {
                prompt_token_count: Some(input),
                candidates_token_count: Some(output),
            }) => TokenUsage::new(input, output),
            _ => TokenUsage::new(estimate_tokens(prompt), estimate_tokens(&text)),
        };

        Ok(GenerationResult {
            cost: GEMINI.cost(&config.model, &usage),
            model: body.model_version.unwrap_or_else(|| config.model.clone()),
            finish_reason: candidate.finish_reason,
            text,
            usage,
        })
    }
}

/// Google reports failures as `{"error": {"code": 400, "status": "INVALID_ARGUMENT", "details": [...]}}`;
/// key problems only show up in `details[].reason`.
fn classify(status: u16, model: &str, body: &str) -> AppError {
    let error = ErrorBody::parse(body);
    let upper = body.to_ascii_uppercase();
    let message = error.message.to_ascii_lowercase();

    let kind = if upper.contains("API_KEY_INVALID") || upper.contains("UNAUTHENTICATED") || status == 401 {
        FailureKind::InvalidKey
    } else if upper.contains("PERMISSION_DENIED") || status == 403 {
        FailureKind::PermissionDenied
    } else if upper.contains("\"NOT_FOUND\"") || status == 404 {
        FailureKind::ModelNotFound
    } else if upper.contains("RESOURCE_EXHAUSTED") || status == 429 {
        if message.contains("quota") {
            FailureKind::QuotaExhausted
        } else {
            FailureKind::RateLimited
        }
    } else if status == 503 {
        FailureKind::Overloaded
    } else if status == 400 {
        FailureKind::BadRequest
    } else if status >= 500 {
        FailureKind::Server
    } else {
        FailureKind::Other
    };
    provider_error(GEMINI.provider, kind, status, model, &error.message)
}

#[async_trait]
impl ModelAdapter for GeminiAdapter {
    fn provider(&self) -> &'static str {
        GEMINI.provider
    }

    async fn model_info(&self) -> ModelInfo {
        GEMINI.info(&self.name, &self.core.config().await)
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
            Err(err) => return failed_connection(&GEMINI, "", None, &err),
        };
        if let Err(err) = GEMINI.validate_key(&config.api_key) {
            return failed_connection(&GEMINI, &config.model, None, &err);
        }

        let outcome = self.send(&client, &config, CONNECTION_TEST_PROMPT, &connection_test_options()).await;
        let result = connection_result(&GEMINI, &config.model, started, outcome);
        info!("Connection test for {}: {}", self.name, result.message);
        result
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        let config = self.core.config().await;
        GEMINI.validate_key(&config.api_key)?;
        let client = self.core.client().await?;
        self.send(&client, &config, prompt, options).await
    }

    async fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        GEMINI.cost(&self.core.config().await.model, usage)
    }

    async fn calculate_flat_cost(&self, tokens: u32) -> f64 {
        GEMINI.flat_cost(&self.core.config().await.model, tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "AIzaSyTestKey-0123456789abcdefghijkl";

    fn adapter_for(server: &MockServer) -> GeminiAdapter {
        GeminiAdapter::new(ModelConfig {
            api_key: KEY.to_string(),
            base_url: Some(server.uri()),
            model: "gemini-1.5-pro".to_string(),
            ..ModelConfig::default()
        })
    }

    #[tokio::test]
    async fn test_generate_text_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-pro:generateContent"))
            .and(header("x-goog-api-key", KEY))
            .and(body_partial_json(json!({
                "systemInstruction": {"parts": [{"text": "Be brief."}]},
                "generationConfig": {"maxOutputTokens": 64}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Hi "}, {"text": "there"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 1000, "candidatesTokenCount": 1000, "totalTokenCount": 2000}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let options = GenerationOptions {
            max_tokens: Some(64),
            system_prompt: Some("Be brief.".to_string()),
            ..GenerationOptions::default()
        };
        let result = adapter_for(&mock_server)
            .generate_text("Hello", &options)
            .await
            .unwrap();

        assert_eq!(result.text, "Hi there");
        assert_eq!(result.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(result.model, "gemini-1.5-pro");
        assert!((result.cost - 0.00625).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_blocked_prompt_is_invalid_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [],
                "promptFeedback": {"blockReason": "SAFETY"}
            })))
            .mount(&mock_server)
            .await;

        let err = adapter_for(&mock_server)
            .generate_text("Hello", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidResponse(ref m) if m.contains("SAFETY")));
    }

    #[tokio::test]
    async fn test_invalid_key_detail() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": 400,
                    "message": "API key not valid. Please pass a valid API key.",
                    "status": "INVALID_ARGUMENT",
                    "details": [{"reason": "API_KEY_INVALID"}]
                }
            })))
            .mount(&mock_server)
            .await;

        let result = adapter_for(&mock_server).test_connection(None).await;
        assert!(!result.success);
        assert!(result.message.contains("Invalid API key"));
    }

    #[test]
    fn test_resource_exhausted() {
        let quota = classify(
            429,
            "gemini-1.5-pro",
            r#"{"error": {"code": 429, "message": "You exceeded your current quota", "status": "RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(quota.to_string().contains("Quota exhausted"));

        let burst = classify(
            429,
            "gemini-1.5-pro",
            r#"{"error": {"code": 429, "message": "Too many requests", "status": "RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(burst.to_string().contains("Rate limit"));
    }

    #[tokio::test]
    async fn test_short_key_rejected_locally() {
        let adapter = GeminiAdapter::new(ModelConfig {
            api_key: "AIza-short".to_string(),
            ..ModelConfig::default()
        });
        let err = adapter
            .generate_text("Hello", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(adapter.model_info().await.model, "gemini-1.5-flash");
    }

    #[tokio::test]
    async fn test_penalties_reach_generation_config() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-pro:generateContent"))
            .and(body_partial_json(json!({
                "generationConfig": {
                    "temperature": 0.25,
                    "frequencyPenalty": 0.5,
                    "presencePenalty": -0.5
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "ok"}]}, "finishReason": "STOP"}]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let options = GenerationOptions {
            temperature: Some(0.25),
            frequency_penalty: Some(0.5),
            presence_penalty: Some(-0.5),
            ..GenerationOptions::default()
        };
        let result = adapter_for(&mock_server)
            .generate_text("Hello", &options)
            .await
            .unwrap();
        assert_eq!(result.text, "ok");
    }

    #[test]
    fn test_neutral_penalties_are_omitted() {
        let config = ModelConfig::default();
        let params = EffectiveParams::resolve(&config, &GenerationOptions::default());
        let value = generation_config(&config, &params);
        assert!(value.get("frequencyPenalty").is_none());
        assert!(value.get("presencePenalty").is_none());
        assert_eq!(value["topP"], json!(1.0));
    }
}
