use crate::auth::{CredentialLookup, Credentials};
use crate::platform::{SupportedPlatforms, LINUX_AMD64, LINUX_ARM64};
use crate::reference::normalize_domain;
use crate::registry::{RegistryClient, RetryPolicy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;


/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "QUARK_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Platforms a multi-platform sync carries over
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,

    /// Backoff for rate-limited and failing registry requests
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-registry settings, keyed by registry domain
    #[serde(default)]
    pub registries: HashMap<String, RegistryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Speak plain HTTP instead of HTTPS
    #[serde(default)]
    pub insecure: bool,
}

fn default_platforms() -> Vec<String> {
    vec![LINUX_AMD64.to_string(), LINUX_ARM64.to_string()]
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platforms: default_platforms(),
            retry: RetryConfig::default(),
            registries: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `$QUARK_CONFIG`, else `<config dir>/quark/config.toml`, else defaults.
    pub fn load() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Config::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("quark").join("config.toml"))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&config.retry.jitter) {
            anyhow::bail!("retry.jitter must be between 0 and 1");
        }
        Ok(config)
    }

    pub fn supported_platforms(&self) -> SupportedPlatforms {
        SupportedPlatforms::new(self.platforms.iter().cloned())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            jitter: self.retry.jitter,
        }
    }

    /// Settings for `domain`, matching config keys after normalization.
    pub fn registry(&self, domain: &str) -> Option<&RegistryConfig> {
        let domain = normalize_domain(domain);
        self.registries
            .iter()
            .find(|(key, _)| normalize_domain(key) == domain)
            .map(|(_, registry)| registry)
    }

    pub fn is_insecure(&self, domain: &str) -> bool {
        self.registry(domain).is_some_and(|r| r.insecure)
    }

    /// HTTP client for `domain` with this config's retry and transport settings.
    pub fn client_for(&self, domain: &str, credentials: &dyn CredentialLookup) -> RegistryClient {
        let domain = normalize_domain(domain);
        RegistryClient::new(&domain, credentials.lookup(&domain))
            .insecure(self.is_insecure(&domain))
            .with_retry(self.retry_policy())
    }

    /// [`Config::client_for`] on the blocking pool. Credential lookups read
    /// files and may spawn `docker-credential-*` helpers.
    pub async fn connect(
        &self,
        domain: &str,
        credentials: Arc<dyn CredentialLookup>,
    ) -> anyhow::Result<RegistryClient> {
        let config = self.clone();
        let target = domain.to_string();
        tokio::task::spawn_blocking(move || config.client_for(&target, credentials.as_ref()))
            .await
            .with_context(|| format!("Credential lookup for {} did not complete", domain))
    }
}

impl CredentialLookup for Config {
    fn lookup(&self, domain: &str) -> Option<Credentials> {
        let registry = self.registry(domain)?;
        Credentials::from_parts(registry.username.as_deref(), registry.password.as_deref())
    }
}
