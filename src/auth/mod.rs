//! Registry credentials and where to find them.
//!
//! The core never reads credentials from ambient state: callers pass a
//! [`CredentialLookup`] that maps a normalized registry domain to an optional
//! username/password pair. "Nothing found" means anonymous access.

use base64::Engine;
use std::fmt;

mod keychain;

pub use keychain::{DockerAuthEntry, DockerConfig, DockerKeychain};

/// Username and password for HTTP Basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials from optional parts, or `None` unless both are non-empty.
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        let creds = Self::new(username?, password?);
        creds.is_usable().then_some(creds)
    }

    /// Basic auth is only sent when both halves are present.
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// `Authorization` header value.
    pub fn basic_header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {}", encoded)
    }

    /// Decode a Docker `auth` field (base64 of `user:password`).
    pub fn from_encoded(auth: &str) -> Option<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Self::from_parts(Some(username), Some(password))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves credentials for a normalized registry domain (`docker.io`, `ghcr.io`,
/// `localhost:5000`).
pub trait CredentialLookup: Send + Sync {
    fn lookup(&self, domain: &str) -> Option<Credentials>;
}

/// No credentials for anything.
pub struct Anonymous;

impl CredentialLookup for Anonymous {
    fn lookup(&self, _domain: &str) -> Option<Credentials> {
        None
    }
}

/// Fixed credentials per domain, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: std::collections::HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, credentials: Credentials) -> Self {
        self.entries
            .insert(crate::reference::normalize_domain(domain), credentials);
        self
    }
}

impl CredentialLookup for StaticCredentials {
    fn lookup(&self, domain: &str) -> Option<Credentials> {
        self.entries
            .get(&crate::reference::normalize_domain(domain))
            .cloned()
    }
}

/// Tries lookups in order and returns the first usable credentials.
pub struct ChainedLookup {
    lookups: Vec<Box<dyn CredentialLookup>>,
}

impl ChainedLookup {
    pub fn new(lookups: Vec<Box<dyn CredentialLookup>>) -> Self {
        Self { lookups }
    }
}

impl CredentialLookup for ChainedLookup {
    fn lookup(&self, domain: &str) -> Option<Credentials> {
        self.lookups
            .iter()
            .filter_map(|l| l.lookup(domain))
            .find(Credentials::is_usable)
    }
}
