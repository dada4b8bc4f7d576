use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

// --- Literature ---

/// One PubMed article record as handed over by the retrieval client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LiteratureItem {
    pub pmid: Option<String>,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub authors: Vec<String>,
    pub journal: String,
    pub year: Option<String>,
    pub keywords: Vec<String>,
}

impl LiteratureItem {
    /// Reduces the record to the text blob consumed by keyword extraction:
    /// title, abstract and the joined keyword list.
    pub fn to_document(&self) -> String {
        let keywords = self.keywords.join(" ");
        [self.title.as_str(), self.abstract_text.as_str(), keywords.as_str()]
            .into_iter()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output language of prompts and parsed analysis sections.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Zh,
    En,
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zh" | "cn" | "chinese" => Ok(Language::Zh),
            "en" | "english" => Ok(Language::En),
            other => Err(format!("unsupported language '{}'", other)),
        }
    }
}

// --- Model configuration ---

/// Connection and generation parameters for one provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    /// Provider secret. Never logged.
    pub api_key: String,
    /// Endpoint override; the provider default is used when absent.
    pub base_url: Option<String>,
    /// Provider model identifier (e.g. `gpt-4o-mini`).
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,
    #[validate(range(min = 1))]
    pub max_tokens: u32,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: f32,
    #[validate(range(min = -2.0, max = 2.0))]
    pub frequency_penalty: f32,
    #[validate(range(min = -2.0, max = 2.0))]
    pub presence_penalty: f32,
    /// Per-request deadline for provider calls.
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
    /// Opaque provider-specific fields merged into the request body.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            timeout_secs: 60,
            extra: BTreeMap::new(),
        }
    }
}

impl ModelConfig {
    /// Merges the `Some` fields of `patch` into this config.
    ///
    /// Returns `true` when a field that affects connectivity changed
    /// (API key, base URL, model or timeout).
    pub fn merge(&mut self, patch: ModelConfigPatch) -> bool {
        let before = (
            self.api_key.clone(),
            self.base_url.clone(),
            self.model.clone(),
            self.timeout_secs,
        );

        if let Some(api_key) = patch.api_key {
            self.api_key = api_key;
        }
        if let Some(base_url) = patch.base_url {
            self.base_url = Some(base_url).filter(|u| !u.trim().is_empty());
        }
        if let Some(model) = patch.model {
            self.model = model;
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = patch.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(top_p) = patch.top_p {
            self.top_p = top_p;
        }
        if let Some(frequency_penalty) = patch.frequency_penalty {
            self.frequency_penalty = frequency_penalty;
        }
        if let Some(presence_penalty) = patch.presence_penalty {
            self.presence_penalty = presence_penalty;
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            self.timeout_secs = timeout_secs;
        }
        if let Some(extra) = patch.extra {
            self.extra.extend(extra);
        }

        before
            != (
                self.api_key.clone(),
                self.base_url.clone(),
                self.model.clone(),
                self.timeout_secs,
            )
    }
}

/// Partial update for a [`ModelConfig`]. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfigPatch {
    pub api_key: Option<String>,
    /// `Some("")` clears the override and falls back to the provider default.
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub timeout_secs: Option<u64>,
    pub extra: Option<BTreeMap<String, serde_json::Value>>,
}

impl From<ModelConfig> for ModelConfigPatch {
    fn from(config: ModelConfig) -> Self {
        Self {
            api_key: Some(config.api_key),
            base_url: Some(config.base_url.unwrap_or_default()),
            model: Some(config.model),
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
            top_p: Some(config.top_p),
            frequency_penalty: Some(config.frequency_penalty),
            presence_penalty: Some(config.presence_penalty),
            timeout_secs: Some(config.timeout_secs),
            extra: Some(config.extra),
        }
    }
}

/// Per-request credential override coming from the route layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelOverride {
    pub name: String,
    pub enabled: bool,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

// --- Status and metadata ---

/// Health record of one registered model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub name: String,
    pub is_available: bool,
    pub last_checked: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ModelStatus {
    /// Initial status at registration time.
    pub fn unavailable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_available: false,
            last_checked: Utc::now(),
            latency_ms: None,
            error: None,
        }
    }

    pub fn available(name: &str, latency_ms: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            is_available: true,
            last_checked: Utc::now(),
            latency_ms,
            error: None,
        }
    }

    pub fn failed(name: &str, latency_ms: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            is_available: false,
            last_checked: Utc::now(),
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Unit prices in the provider's currency per 1000 tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub model: String,
    /// Context window of the configured model.
    pub max_tokens: u32,
    pub supports_chinese: bool,
    pub pricing: Pricing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub provider: String,
    pub model: String,
    pub latency_ms: Option<u64>,
}

// --- Generation ---

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Per-call overrides layered over the adapter's stored defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationOptions {
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f32>,
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f32>,
    #[validate(range(min = -2.0, max = 2.0))]
    pub frequency_penalty: Option<f32>,
    #[validate(range(min = -2.0, max = 2.0))]
    pub presence_penalty: Option<f32>,
    pub system_prompt: Option<String>,
    /// Registered model name; required by the service manager.
    pub preferred_model: Option<String>,
}

impl GenerationOptions {
    pub fn for_model(name: &str) -> Self {
        Self {
            preferred_model: Some(name.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub text: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub model: String,
    pub finish_reason: Option<String>,
}

// --- Batch analysis ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisOptions {
    pub language: Language,
    pub preferred_model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl AnalysisOptions {
    pub fn for_model(name: &str, language: Language) -> Self {
        Self {
            language,
            preferred_model: Some(name.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemAnalysis {
    pub index: usize,
    pub title: String,
    pub analysis: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub research_suggestions: Vec<String>,
    pub analyses: Vec<ItemAnalysis>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub processing_time_ms: u64,
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unspecified_fields() {
        let mut config = ModelConfig {
            api_key: "sk-original-key-123456".to_string(),
            base_url: Some("https://proxy.example.com/v1".to_string()),
            model: "gpt-4o".to_string(),
            ..ModelConfig::default()
        };

        let changed = config.merge(ModelConfigPatch {
            model: Some("x".to_string()),
            ..ModelConfigPatch::default()
        });

        assert!(changed);
        assert_eq!(config.model, "x");
        assert_eq!(config.api_key, "sk-original-key-123456");
        assert_eq!(config.base_url.as_deref(), Some("https://proxy.example.com/v1"));
    }

    #[test]
    fn test_merge_generation_defaults_is_not_a_connectivity_change() {
        let mut config = ModelConfig::default();
        let changed = config.merge(ModelConfigPatch {
            temperature: Some(0.2),
            ..ModelConfigPatch::default()
        });
        assert!(!changed);
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_base_url_clears_override() {
        let mut config = ModelConfig {
            base_url: Some("https://proxy.example.com".to_string()),
            ..ModelConfig::default()
        };
        config.merge(ModelConfigPatch {
            base_url: Some(String::new()),
            ..ModelConfigPatch::default()
        });
        assert_eq!(config.base_url, None);
    }

    #[test]
    fn test_config_validation_rejects_out_of_range_temperature() {
        let config = ModelConfig {
            model: "gpt-4o".to_string(),
            temperature: 3.5,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_literature_item_to_document() {
        let item = LiteratureItem {
            title: "Vaccine efficacy".to_string(),
            abstract_text: "We measured antibody titers.".to_string(),
            keywords: vec!["covid-19".to_string(), "mrna".to_string()],
            ..LiteratureItem::default()
        };
        assert_eq!(
            item.to_document(),
            "Vaccine efficacy We measured antibody titers. covid-19 mrna"
        );
    }

    #[test]
    fn test_literature_item_deserializes_abstract_field() {
        let json = r#"{"title": "T", "abstract": "A", "authors": ["Li Wei"], "journal": "Nature"}"#;
        let item: LiteratureItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.abstract_text, "A");
        assert_eq!(item.authors, vec!["Li Wei".to_string()]);
        assert!(item.keywords.is_empty());
    }

    #[test]
    fn test_language_parsing() {
        assert_eq!("EN".parse::<Language>().unwrap(), Language::En);
        assert_eq!("zh".parse::<Language>().unwrap(), Language::Zh);
        assert!("fr".parse::<Language>().is_err());
    }
}
