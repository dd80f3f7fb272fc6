//! Model resolver: discovers which remote models a credential can call and
//! picks one by a fixed preference order.
//!
//! Resolutions are cached on disk with no TTL; re-resolving on every call
//! would double API traffic. The cache key is derived from a short prefix of
//! the credential, never the full secret. A cached model that the provider
//! later deprecates will keep failing until the entry is invalidated.

use crate::config::ApiConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// API variant the model listing and generation calls go through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiVariant {
    V1Beta,
    V1,
}

impl ApiVariant {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ApiVariant::V1Beta => "v1beta",
            ApiVariant::V1 => "v1",
        }
    }
}

/// Concrete model chosen for a credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub model_id: String,
    pub api_variant: ApiVariant,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
struct ListModelsResponse {
    models: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "supportedGenerationMethods")]
    supported_generation_methods: Option<Vec<String>>,
}

/// Resolves and caches the model to use per credential
pub struct ModelResolver {
    config: ApiConfig,
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl ModelResolver {
    pub fn new(config: ApiConfig, state_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            config,
            client,
            cache_dir: state_dir.join("models"),
        })
    }

    /// Resolve the model for a credential, consulting the disk cache first.
    pub async fn resolve(&self, credential: &str) -> Result<ResolvedModel> {
        if let Some(cached) = self.load_cached(credential).await {
            debug!("Model cache hit: {}", cached.model_id);
            return Ok(cached);
        }

        let resolved = self.resolve_remote(credential).await?;
        self.save_cached(credential, &resolved).await;

        info!(
            "Resolved model {} ({}) via {}",
            resolved.model_id,
            resolved.display_name,
            resolved.api_variant.path_segment()
        );
        Ok(resolved)
    }

    /// List models under v1beta, falling back once to v1 on transport or
    /// HTTP failure. Any other failure propagates.
    async fn resolve_remote(&self, credential: &str) -> Result<ResolvedModel> {
        let models = match self.list_models(credential, ApiVariant::V1Beta).await {
            Ok(models) => return self.pick_model(models, ApiVariant::V1Beta),
            Err(e @ (Error::Http(_) | Error::Api { .. })) => {
                warn!("Model listing failed under v1beta, retrying under v1: {}", e);
                self.list_models(credential, ApiVariant::V1).await?
            }
            Err(e) => return Err(e),
        };
        self.pick_model(models, ApiVariant::V1)
    }

    async fn list_models(&self, credential: &str, variant: ApiVariant) -> Result<Vec<ModelEntry>> {
        let url = format!(
            "{}/{}/models?key={}",
            self.config.base_url,
            variant.path_segment(),
            credential
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(crate::client::classify_http_error(status.as_u16(), &body));
        }

        let listing: ListModelsResponse = response.json().await?;
        Ok(listing.models.unwrap_or_default())
    }

    /// Rank capable models: a "flash" name wins, then "pro", then the first
    /// remaining capable model in listing order.
    fn pick_model(&self, models: Vec<ModelEntry>, variant: ApiVariant) -> Result<ResolvedModel> {
        let capable: Vec<ModelEntry> = models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .as_deref()
                    .map(|methods| methods.iter().any(|method| method == "generateContent"))
                    .unwrap_or(false)
            })
            .collect();

        if capable.is_empty() {
            return Err(Error::NoModelAvailable);
        }

        let chosen = capable
            .iter()
            .find(|m| m.name.contains("flash"))
            .or_else(|| capable.iter().find(|m| m.name.contains("pro")))
            .unwrap_or(&capable[0]);

        let model_id = chosen
            .name
            .strip_prefix("models/")
            .unwrap_or(&chosen.name)
            .to_string();

        Ok(ResolvedModel {
            display_name: chosen.display_name.clone().unwrap_or_else(|| model_id.clone()),
            model_id,
            api_variant: variant,
        })
    }

    /// Cache file name from a short credential prefix, hashed so the secret
    /// never appears on disk.
    fn cache_path(&self, credential: &str) -> PathBuf {
        let prefix: String = credential.chars().take(8).collect();
        let digest = md5::compute(prefix.as_bytes());
        self.cache_dir.join(format!("{:x}.json", digest))
    }

    async fn load_cached(&self, credential: &str) -> Option<ResolvedModel> {
        let path = self.cache_path(credential);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                warn!("Failed to parse model cache {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn save_cached(&self, credential: &str, resolved: &ResolvedModel) {
        if let Err(e) = tokio::fs::create_dir_all(&self.cache_dir).await {
            warn!("Failed to create model cache dir: {}", e);
            return;
        }
        let path = self.cache_path(credential);
        match serde_json::to_string_pretty(resolved) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json).await {
                    warn!("Failed to write model cache {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize model cache entry: {}", e),
        }
    }

    /// Drop the cached resolution for one credential.
    pub async fn invalidate(&self, credential: &str) -> Result<bool> {
        let path = self.cache_path(credential);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            info!("Invalidated model cache entry");
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop every cached resolution.
    pub async fn clear(&self) -> Result<usize> {
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        let mut cleared = 0;
        let mut entries = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json")
                && tokio::fs::remove_file(&path).await.is_ok()
            {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!("Cleared {} model cache entries", cleared);
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn resolver(dir: &TempDir) -> ModelResolver {
        let config = Config::default();
        ModelResolver::new(config.api, dir.path().to_path_buf()).unwrap()
    }

    fn entry(name: &str, methods: &[&str]) -> ModelEntry {
        ModelEntry {
            name: name.to_string(),
            display_name: Some(name.trim_start_matches("models/").to_string()),
            supported_generation_methods: Some(methods.iter().map(|m| m.to_string()).collect()),
        }
    }

    #[tokio::test]
    async fn test_pick_prefers_flash_over_pro() {
        let dir = TempDir::new().unwrap();
        let models = vec![
            entry("models/gemini-pro-vision", &["generateContent"]),
            entry("models/gemini-flash-latest", &["generateContent"]),
        ];
        let resolved = resolver(&dir).pick_model(models, ApiVariant::V1Beta).unwrap();
        assert_eq!(resolved.model_id, "gemini-flash-latest");
        assert_eq!(resolved.api_variant, ApiVariant::V1Beta);
    }

    #[tokio::test]
    async fn test_pick_falls_back_to_pro_then_listing_order() {
        let dir = TempDir::new().unwrap();
        let models = vec![
            entry("models/embedding-001", &["embedContent"]),
            entry("models/gemini-pro", &["generateContent"]),
        ];
        let resolved = resolver(&dir).pick_model(models, ApiVariant::V1).unwrap();
        assert_eq!(resolved.model_id, "gemini-pro");

        let models = vec![
            entry("models/other-capable", &["generateContent"]),
            entry("models/another", &["generateContent"]),
        ];
        let resolved = resolver(&dir).pick_model(models, ApiVariant::V1).unwrap();
        assert_eq!(resolved.model_id, "other-capable");
    }

    #[tokio::test]
    async fn test_pick_requires_generate_content() {
        let dir = TempDir::new().unwrap();
        let models = vec![entry("models/embedding-001", &["embedContent"])];
        assert!(matches!(
            resolver(&dir).pick_model(models, ApiVariant::V1Beta),
            Err(Error::NoModelAvailable)
        ));
    }

    #[tokio::test]
    async fn test_cache_roundtrip_and_invalidate() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let credential = "AIzaSyTestCredential0123456789";

        assert!(resolver.load_cached(credential).await.is_none());

        let resolved = ResolvedModel {
            model_id: "gemini-flash-latest".to_string(),
            api_variant: ApiVariant::V1Beta,
            display_name: "Gemini Flash".to_string(),
        };
        resolver.save_cached(credential, &resolved).await;

        let cached = resolver.load_cached(credential).await.unwrap();
        assert_eq!(cached.model_id, "gemini-flash-latest");

        assert!(resolver.invalidate(credential).await.unwrap());
        assert!(resolver.load_cached(credential).await.is_none());
    }

    #[tokio::test]
    async fn test_listing_error_display_omits_credential() {
        use crate::config::ConfigBuilder;

        let dir = TempDir::new().unwrap();
        let config = ConfigBuilder::new()
            .with_base_url("http://127.0.0.1:9".to_string())
            .with_timeout(2)
            .build();
        let resolver = ModelResolver::new(config.api, dir.path().to_path_buf()).unwrap();

        let credential = "AIzaSy-very-secret-credential";
        let err = resolver.resolve(credential).await.unwrap_err();
        let rendered = err.to_string();
        assert!(
            !rendered.contains(credential),
            "credential leaked into error: {}",
            rendered
        );
    }

    #[tokio::test]
    async fn test_cache_key_uses_prefix_not_full_secret() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver(&dir);
        let a = resolver.cache_path("AIzaSy01-same-prefix-AAAA");
        let b = resolver.cache_path("AIzaSy01-same-prefix-BBBB");
        assert_eq!(a, b);

        let c = resolver.cache_path("DIFFERENT-prefix-000000");
        assert_ne!(a, c);
    }
}
