//! Multi-provider AI generation layer.
//!
//! - `traits`: the [`ModelAdapter`] capability surface
//! - `provider`: shared adapter plumbing (config, HTTP client, key rules, pricing)
//! - `openai`, `anthropic`, `gemini`: vendor adapters
//! - `analysis`: default batch literature analysis
//! - `manager`: [`AiServiceManager`] registry with status, cache and retries

pub mod analysis;
pub mod anthropic;
pub mod gemini;
pub mod manager;
pub mod openai;
pub mod provider;
pub mod traits;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use manager::{AiServiceManager, CacheStats, ManagerSettings};
pub use openai::OpenAiCompatibleAdapter;
pub use traits::ModelAdapter;
