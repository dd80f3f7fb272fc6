use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the stock metadata generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote API settings
    pub api: ApiConfig,

    /// Inter-row pacing settings
    pub pacing: PacingConfig,

    /// Advisory validation rules for generated metadata
    pub validation: ValidationRules,

    /// Local state and persistence settings
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the generative language API
    pub base_url: String,

    /// Hard timeout for a single generation request (seconds)
    pub timeout_seconds: u64,

    /// Maximum tokens to generate per request
    pub max_output_tokens: u32,

    /// Temperature for generation (low = consistent metadata)
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay after a row settles successfully (milliseconds)
    pub success_delay_ms: u64,

    /// Delay after a row settles in error (milliseconds), longer to back off
    pub failure_delay_ms: u64,
}

/// Fixed rule set applied to normalized output. Violations are advisory,
/// never hard rejections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Title length range (chars)
    pub title_min: usize,
    pub title_max: usize,

    /// Description length range (chars)
    pub description_min: usize,
    pub description_max: usize,

    /// Keyword count range
    pub keywords_min: usize,
    pub keywords_max: usize,

    /// Minimum credential length accepted by the format check
    pub credential_min_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted rows, credentials, and the resolver cache
    pub state_dir: PathBuf,

    /// Keep image previews for successful rows when serializing
    pub keep_previews: bool,
}

impl Config {
    /// Load configuration from file, falling back to env overrides
    pub fn load() -> Result<Self> {
        let config_paths = [
            "stockmeta.toml",
            "config/stockmeta.toml",
            "~/.config/stockmeta/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str(&config_str) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from: {}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Self::from_env()
    }

    /// Build configuration from defaults plus environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("STOCKMETA_TIMEOUT_SECONDS") {
            config.api.timeout_seconds = timeout.parse().unwrap_or(30);
        }

        if let Ok(state_dir) = std::env::var("STOCKMETA_STATE_DIR") {
            config.storage.state_dir = PathBuf::from(state_dir);
        }

        if let Ok(delay) = std::env::var("STOCKMETA_SUCCESS_DELAY_MS") {
            config.pacing.success_delay_ms = delay.parse().unwrap_or(2000);
        }

        if let Ok(delay) = std::env::var("STOCKMETA_FAILURE_DELAY_MS") {
            config.pacing.failure_delay_ms = delay.parse().unwrap_or(5000);
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.timeout_seconds == 0 {
            return Err(anyhow!("timeout_seconds must be greater than 0"));
        }

        if self.validation.title_min > self.validation.title_max {
            return Err(anyhow!("title length range is inverted"));
        }

        if self.validation.description_min > self.validation.description_max {
            return Err(anyhow!("description length range is inverted"));
        }

        if self.validation.keywords_min > self.validation.keywords_max {
            return Err(anyhow!("keyword count range is inverted"));
        }

        if self.pacing.failure_delay_ms < self.pacing.success_delay_ms {
            return Err(anyhow!(
                "failure_delay_ms must be at least success_delay_ms (backoff)"
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                timeout_seconds: 30,
                max_output_tokens: 2048,
                temperature: 0.2,
            },
            pacing: PacingConfig {
                success_delay_ms: 2000,
                failure_delay_ms: 5000,
            },
            validation: ValidationRules::default(),
            storage: StorageConfig {
                state_dir: PathBuf::from("./state"),
                keep_previews: false,
            },
        }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            title_min: 10,
            title_max: 70,
            description_min: 120,
            description_max: 200,
            keywords_min: 25,
            keywords_max: 49,
            credential_min_length: 20,
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.state_dir = dir;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.config.api.timeout_seconds = seconds;
        self
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.config.api.base_url = base_url;
        self
    }

    pub fn with_pacing(mut self, success_ms: u64, failure_ms: u64) -> Self {
        self.config.pacing.success_delay_ms = success_ms;
        self.config.pacing.failure_delay_ms = failure_ms;
        self
    }

    pub fn keep_previews(mut self, keep: bool) -> Self {
        self.config.storage.keep_previews = keep;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api.timeout_seconds, 30);
        assert_eq!(config.validation.title_min, 10);
        assert_eq!(config.validation.title_max, 70);
        assert_eq!(config.validation.keywords_max, 49);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_timeout(60)
            .with_pacing(100, 300)
            .keep_previews(true)
            .build();

        assert_eq!(config.api.timeout_seconds, 60);
        assert_eq!(config.pacing.success_delay_ms, 100);
        assert!(config.storage.keep_previews);
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let config = ConfigBuilder::new().with_pacing(5000, 1000).build();
        assert!(config.validate().is_err());
    }
}
