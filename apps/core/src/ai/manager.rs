//! Registry of model adapters with liveness tracking, result caching and retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::ai::traits::ModelAdapter;
use crate::error::AppError;
use crate::models::{
    AnalysisOptions, AnalysisResult, ConnectionTestResult, GenerationOptions, GenerationResult,
    LiteratureItem, ModelConfig, ModelConfigPatch, ModelOverride, ModelStatus,
};

/// Retry and cache policy of an [`AiServiceManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Total attempts per call, including the first one.
    pub max_retries: u32,
    /// Fixed wait between two attempts.
    pub retry_delay: Duration,
    pub cache_ttl: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Snapshot of the result cache for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone)]
enum CachedValue {
    Generation(GenerationResult),
    Analysis(AnalysisResult),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CachedValue,
    stored_at: Instant,
}

/// Single entry point for AI generation.
///
/// Owns one adapter and one [`ModelStatus`] per registered name. Requests
/// must name their target model; there is no implicit default.
pub struct AiServiceManager {
    settings: ManagerSettings,
    adapters: RwLock<BTreeMap<String, Arc<dyn ModelAdapter>>>,
    statuses: RwLock<BTreeMap<String, ModelStatus>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for AiServiceManager {
    fn default() -> Self {
        Self::new(ManagerSettings::default())
    }
}

impl AiServiceManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            adapters: RwLock::new(BTreeMap::new()),
            statuses: RwLock::new(BTreeMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Adds (or replaces) an adapter. Its status starts unavailable until a
    /// connection test succeeds.
    pub async fn register_adapter(&self, name: &str, adapter: Arc<dyn ModelAdapter>) {
        info!("Registering model '{}' ({})", name, adapter.provider());
        self.adapters.write().await.insert(name.to_string(), adapter);
        self.statuses
            .write()
            .await
            .insert(name.to_string(), ModelStatus::unavailable(name));
    }

    /// Registered names in sorted order.
    pub async fn registered_models(&self) -> Vec<String> {
        self.adapters.read().await.keys().cloned().collect()
    }

    pub async fn model_status(&self, name: &str) -> Option<ModelStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    /// Overwrites the stored status. Used by connection tests and by trusted
    /// configuration flows that vouch for a model without a live test.
    pub async fn set_model_status(&self, name: &str, status: ModelStatus) {
        self.statuses.write().await.insert(name.to_string(), status);
    }

    pub async fn all_model_statuses(&self) -> Vec<ModelStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    async fn adapter(&self, name: &str) -> Option<Arc<dyn ModelAdapter>> {
        self.adapters.read().await.get(name).cloned()
    }

    /// Runs the adapter's connection test and records the outcome as the
    /// model's status. Unregistered names yield a failed result.
    #[instrument(skip(self, config))]
    pub async fn test_model_connection(
        &self,
        name: &str,
        config: Option<ModelConfig>,
    ) -> ConnectionTestResult {
        let Some(adapter) = self.adapter(name).await else {
            return ConnectionTestResult {
                success: false,
                message: AppError::UnknownModel(name.to_string()).to_string(),
                provider: String::new(),
                model: name.to_string(),
                latency_ms: None,
            };
        };

        let started = Instant::now();
        let result = adapter.test_connection(config).await;
        let latency_ms = Some(started.elapsed().as_millis() as u64);

        let status = if result.success {
            ModelStatus::available(name, latency_ms)
        } else {
            ModelStatus::failed(name, latency_ms, result.message.clone())
        };
        self.set_model_status(name, status).await;

        if result.success {
            info!("Model '{}' is available ({:?} ms)", name, latency_ms);
        } else {
            warn!("Model '{}' failed its connection test: {}", name, result.message);
        }
        result
    }

    /// Merges `patch` into the named adapter's config. Unregistered names are ignored.
    pub async fn update_model_config(
        &self,
        name: &str,
        patch: ModelConfigPatch,
    ) -> Result<(), AppError> {
        match self.adapter(name).await {
            Some(adapter) => adapter.update_config(patch).await,
            None => {
                debug!("Ignoring config update for unregistered model '{}'", name);
                Ok(())
            }
        }
    }

    pub async fn model_config(&self, name: &str) -> Option<ModelConfig> {
        match self.adapter(name).await {
            Some(adapter) => Some(adapter.config().await),
            None => None,
        }
    }

    /// Applies per-request credential overrides: every enabled override with a
    /// key is merged into its model's config and the model is marked available.
    pub async fn apply_model_overrides(&self, overrides: &[ModelOverride]) {
        for entry in overrides {
            if !entry.enabled || entry.api_key.trim().is_empty() {
                continue;
            }
            if self.adapter(&entry.name).await.is_none() {
                debug!("Skipping override for unregistered model '{}'", entry.name);
                continue;
            }

            let patch = ModelConfigPatch {
                api_key: Some(entry.api_key.clone()),
                base_url: entry.base_url.clone(),
                model: entry.model.clone().filter(|m| !m.trim().is_empty()),
                ..ModelConfigPatch::default()
            };
            if let Err(err) = self.update_model_config(&entry.name, patch).await {
                warn!("Override for model '{}' rejected: {}", entry.name, err);
                continue;
            }
            self.set_model_status(&entry.name, ModelStatus::available(&entry.name, None))
                .await;
        }
    }

    /// Resolves the required target model and checks it can serve requests.
    async fn select(&self, preferred: Option<&str>) -> Result<(String, Arc<dyn ModelAdapter>), AppError> {
        let name = preferred
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AppError::Config("A target model must be specified (preferredModel)".to_string())
            })?;

        let adapter = self
            .adapter(name)
            .await
            .ok_or_else(|| AppError::UnknownModel(name.to_string()))?;

        let available = self
            .model_status(name)
            .await
            .map(|s| s.is_available)
            .unwrap_or(false);
        if !available {
            return Err(AppError::ModelUnavailable(name.to_string()));
        }
        Ok((name.to_string(), adapter))
    }

    /// Generates text with the model named in `options.preferred_model`.
    #[instrument(skip(self, prompt, options), fields(model = ?options.preferred_model))]
    pub async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, AppError> {
        let (name, adapter) = self.select(options.preferred_model.as_deref()).await?;
        let key = cache_key("generate", &name, prompt, options)?;

        if let Some(CachedValue::Generation(hit)) = self.cached(&key).await {
            debug!("Cache hit for generation on '{}'", name);
            return Ok(hit);
        }

        let adapter = adapter.as_ref();
        let result = self
            .with_retries(&name, move || adapter.generate_text(prompt, options))
            .await?;
        self.store(key, CachedValue::Generation(result.clone())).await;
        Ok(result)
    }

    /// Batch literature analysis with the model named in `options.preferred_model`.
    #[instrument(skip(self, items, options), fields(model = ?options.preferred_model, items = items.len()))]
    pub async fn batch_analyze(
        &self,
        items: &[LiteratureItem],
        options: &AnalysisOptions,
    ) -> Result<AnalysisResult, AppError> {
        let (name, adapter) = self.select(options.preferred_model.as_deref()).await?;
        let payload = serde_json::to_string(items)?;
        let key = cache_key("analyze", &name, &payload, options)?;

        if let Some(CachedValue::Analysis(hit)) = self.cached(&key).await {
            debug!("Cache hit for analysis on '{}'", name);
            return Ok(hit);
        }

        let adapter = adapter.as_ref();
        let result = self
            .with_retries(&name, move || adapter.batch_analyze(items, options))
            .await?;
        self.store(key, CachedValue::Analysis(result.clone())).await;
        Ok(result)
    }

    /// Sequential attempts with a fixed delay in between. The first success
    /// refreshes the status; exhaustion marks the model unavailable and
    /// returns the last error.
    async fn with_retries<T, F, Fut>(&self, name: &str, mut attempt: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        let attempts = self.settings.max_retries.max(1);
        let mut last_error = None;

        for n in 1..=attempts {
            let started = Instant::now();
            match attempt().await {
                Ok(value) => {
                    let latency_ms = Some(started.elapsed().as_millis() as u64);
                    self.set_model_status(name, ModelStatus::available(name, latency_ms))
                        .await;
                    return Ok(value);
                }
                Err(err) => {
                    warn!("Attempt {}/{} on '{}' failed: {}", n, attempts, name, err);
                    last_error = Some(err);
                    if n < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| AppError::Internal("retry loop made no attempt".to_string()));
        self.set_model_status(name, ModelStatus::failed(name, None, err.to_string()))
            .await;
        Err(err)
    }

    async fn cached(&self, key: &str) -> Option<CachedValue> {
        let mut cache = self.cache.lock().await;
        self.evict_expired(&mut cache);
        cache.get(key).map(|entry| entry.value.clone())
    }

    async fn store(&self, key: String, value: CachedValue) {
        let mut cache = self.cache.lock().await;
        self.evict_expired(&mut cache);
        cache.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_expired(&self, cache: &mut HashMap<String, CacheEntry>) {
        let ttl = self.settings.cache_ttl;
        let before = cache.len();
        cache.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!("Evicted {} expired cache entries", evicted);
        }
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        info!("AI result cache cleared");
    }

    pub async fn cache_stats(&self) -> CacheStats {
        let mut cache = self.cache.lock().await;
        self.evict_expired(&mut cache);
        let mut keys: Vec<String> = cache.keys().cloned().collect();
        keys.sort();
        CacheStats {
            size: cache.len(),
            keys,
        }
    }
}

/// `kind:model:sha256(payload, options)`.
fn cache_key<O: Serialize>(
    kind: &str,
    model: &str,
    payload: &str,
    options: &O,
) -> Result<String, AppError> {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher.update([0x1f]);
    hasher.update(serde_json::to_vec(options)?);
    Ok(format!("{}:{}:{:x}", kind, model, hasher.finalize()))
}
