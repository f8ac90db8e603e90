//! Credentials from Docker's `config.json`: inline `auths` entries and
//! `docker-credential-*` helpers.

use super::{CredentialLookup, Credentials};
use crate::reference::{normalize_domain, DEFAULT_DOMAIN};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Docker config file structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
    #[serde(rename = "credHelpers", default)]
    pub cred_helpers: HashMap<String, String>,
    #[serde(rename = "credsStore", skip_serializing_if = "Option::is_none")]
    pub creds_store: Option<String>,
}

/// Entry in the Docker config auths section
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerAuthEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DockerAuthEntry {
    /// Explicit username/password win over the encoded `auth` field.
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.username.as_deref(), self.password.as_deref())
            .or_else(|| self.auth.as_deref().and_then(Credentials::from_encoded))
    }
}

impl DockerConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Locations Docker and compatible tools keep this file, most specific first.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(docker_config) = std::env::var("DOCKER_CONFIG") {
            paths.push(PathBuf::from(docker_config).join("config.json"));
        }
        if let Ok(auth_file) = std::env::var("REGISTRY_AUTH_FILE") {
            paths.push(PathBuf::from(auth_file));
        }
        if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
            paths.push(PathBuf::from(xdg_runtime).join("containers/auth.json"));
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".docker/config.json"));
        }

        paths
    }

    /// First readable config among [`default_paths`](Self::default_paths), or an
    /// empty one.
    pub fn load_default() -> Self {
        for path in Self::default_paths() {
            if !path.exists() {
                continue;
            }
            match Self::from_path(&path) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded docker config");
                    return config;
                }
                Err(e) => warn!("ignoring docker config: {:#}", e),
            }
        }
        Self::default()
    }

    /// The `auths` entry for `domain`, trying the key spellings Docker uses.
    fn find_auth_entry(&self, domain: &str) -> Option<&DockerAuthEntry> {
        key_variants(domain)
            .iter()
            .find_map(|key| self.auths.get(key))
            .or_else(|| {
                self.auths
                    .iter()
                    .find(|(key, _)| normalize_domain(key.trim_end_matches("/v1/").trim_end_matches("/v2/")) == domain)
                    .map(|(_, entry)| entry)
            })
    }

    /// Helper configured for `domain`, falling back to the default store.
    fn credential_helper(&self, domain: &str) -> Option<&str> {
        key_variants(domain)
            .iter()
            .find_map(|key| self.cred_helpers.get(key))
            .or(self.creds_store.as_ref())
            .map(String::as_str)
    }
}

/// Spellings a registry may be keyed under in `config.json`.
fn key_variants(domain: &str) -> Vec<String> {
    if domain == DEFAULT_DOMAIN {
        return vec![
            "https://index.docker.io/v1/".to_string(),
            "index.docker.io".to_string(),
            "docker.io".to_string(),
            "https://index.docker.io/v2/".to_string(),
            "registry-1.docker.io".to_string(),
        ];
    }
    vec![
        domain.to_string(),
        format!("https://{}", domain),
        format!("http://{}", domain),
        format!("https://{}/v1/", domain),
        format!("https://{}/v2/", domain),
    ]
}

/// Run `docker-credential-<helper> get` for `server`.
fn execute_credential_helper(helper: &str, server: &str) -> Result<Option<Credentials>> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let helper_name = format!("docker-credential-{}", helper);
    debug!(helper = %helper_name, %server, "executing credential helper");

    let mut child = Command::new(&helper_name)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn credential helper {}", helper_name))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(server.as_bytes())?;
        stdin.write_all(b"\n")?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Helpers report a missing entry on stdout with a non-zero exit.
        if stdout.contains("credentials not found") {
            return Ok(None);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("credential helper {} failed: {}", helper_name, stderr.trim());
    }

    #[derive(Deserialize)]
    struct HelperResponse {
        #[serde(rename = "Username")]
        username: Option<String>,
        #[serde(rename = "Secret")]
        secret: Option<String>,
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout)
        .context("failed to parse credential helper response")?;
    Ok(Credentials::from_parts(
        response.username.as_deref(),
        response.secret.as_deref(),
    ))
}

/// [`CredentialLookup`] over a Docker config file.
#[derive(Debug, Clone, Default)]
pub struct DockerKeychain {
    config: DockerConfig,
}

impl DockerKeychain {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Keychain over the user's Docker config, if any.
    pub fn from_environment() -> Self {
        Self::new(DockerConfig::load_default())
    }
}

impl CredentialLookup for DockerKeychain {
    fn lookup(&self, domain: &str) -> Option<Credentials> {
        let domain = normalize_domain(domain);

        if let Some(entry) = self.config.find_auth_entry(&domain) {
            if let Some(creds) = entry.credentials() {
                debug!(%domain, "using credentials from docker config");
                return Some(creds);
            }
        }

        let helper = self.config.credential_helper(&domain)?;
        let server = key_variants(&domain).into_iter().next()?;
        match execute_credential_helper(helper, &server) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(%domain, "credential helper failed: {:#}", e);
                None
            }
        }
    }
}
