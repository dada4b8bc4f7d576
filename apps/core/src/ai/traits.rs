use crate::ai::analysis;
use crate::error::AppError;
use crate::models::{
    AnalysisOptions, AnalysisResult, ConnectionTestResult, GenerationOptions, GenerationResult,
    LiteratureItem, ModelConfig, ModelConfigPatch, ModelInfo, TokenUsage,
};
use async_trait::async_trait;

/// Defines the public interface of one AI provider backend.
///
/// This trait abstracts the vendor API so the service manager can route
/// generation and analysis requests to OpenAI, Anthropic, Gemini or any
/// OpenAI-compatible endpoint interchangeably.
#[async_trait]
pub trait ModelAdapter: Send + Sync + 'static {
    /// Human-readable provider name used in messages (e.g. "OpenAI").
    fn provider(&self) -> &'static str;

    /// Provider, configured model, context limit and pricing.
    async fn model_info(&self) -> ModelInfo;

    /// Returns an owned copy of the live configuration.
    async fn config(&self) -> ModelConfig;

    /// Merges the patch into the live configuration.
    ///
    /// Changing the API key, base URL, model or timeout drops the cached
    /// HTTP client so the next call rebuilds it. A patch producing an
    /// out-of-range config fails with `AppError::Validation` (or
    /// `AppError::Config` for a bad base URL) and changes nothing.
    async fn update_config(&self, patch: ModelConfigPatch) -> Result<(), AppError>;

    /// Validates the key and issues one minimal generation call.
    ///
    /// Uses `config` instead of the stored configuration when given. Never
    /// fails: problems are reported through the returned result.
    async fn test_connection(&self, config: Option<ModelConfig>) -> ConnectionTestResult;

    /// Generates a completion with per-call overrides layered over the stored defaults.
    async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError>;

    /// Analyzes a set of articles with a single generation call.
    async fn batch_analyze(
        &self,
        items: &[LiteratureItem],
        options: &AnalysisOptions,
    ) -> Result<AnalysisResult, AppError> {
        analysis::run_batch_analysis(self, items, options).await
    }

    /// Estimated cost of a call, from per-1000-token prompt and completion prices.
    async fn calculate_cost(&self, usage: &TokenUsage) -> f64;

    /// Legacy single-number form: `tokens * flat rate`.
    async fn calculate_flat_cost(&self, tokens: u32) -> f64;
}
