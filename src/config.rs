use crate::models::Provider;
use crate::providers::PROVIDER_TIMEOUT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// How long cached results are shown before fetching again
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Budget for each provider within one fetch cycle
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_provider_timeout_secs() -> u64 {
    PROVIDER_TIMEOUT.as_secs()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the provider's default credential file
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credentials_path: None,
        }
    }
}

impl Config {
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("usage-bar")
            .join("config.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn is_provider_enabled(&self, provider: Provider) -> bool {
        self.providers
            .get(&provider)
            .map(|c| c.enabled)
            .unwrap_or(true)
    }

    pub fn credentials_path(&self, provider: Provider) -> Option<PathBuf> {
        self.providers
            .get(&provider)
            .and_then(|c| c.credentials_path.clone())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.general.cache_ttl_secs as i64)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.general.provider_timeout_secs.max(1))
    }
}
