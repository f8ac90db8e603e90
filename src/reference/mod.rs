//! Image reference parsing and normalization.
//!
//! Accepts the Docker-style `[domain/]path[:tag][@digest]` grammar plus bare
//! digests (`sha256:<hex>` or just `<hex>`). Anything else is rejected.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

mod digest;

pub use digest::{Algorithm, Digest};


pub const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
pub const DEFAULT_TAG: &str = "latest";
const NAME_TOTAL_LENGTH_MAX: usize = 255;
const SHORT_ID_LENGTH: usize = 5;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let path_component = r"[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*";
    let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    let host = format!(r"(?:{d}(?:\.{d})*|\[[a-fA-F0-9:]+\])", d = domain_component);
    let name = format!(
        r"(?:{host}(?::[0-9]+)?/)?{p}(?:/{p})*",
        host = host,
        p = path_component
    );
    let tag = r"[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}";
    let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
    Regex::new(&format!(r"^({name})(?::({tag}))?(?:@({digest}))?$"))
        .expect("reference grammar is a valid regex")
});

/// A parsed, normalized image reference. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    protocol: Option<String>,
    domain: String,
    path: String,
    tag: Option<String>,
    explicit_tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a raw reference string.
    ///
    /// Bare digests are tried first (`sha256:<hex>`, then `<hex>` with an implied
    /// `sha256:`); everything else goes through the named-reference grammar,
    /// with Docker Hub defaults applied and `latest` added when neither tag nor
    /// digest is given.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(digest) = parse_bare_digest(raw) {
            return Ok(Self {
                protocol: None,
                domain: String::new(),
                path: String::new(),
                tag: None,
                explicit_tag: None,
                digest: Some(digest),
            });
        }

        parse_named(raw)
    }

    /// Alternate content protocol. Always `None` for parsed references: a
    /// `scheme://` string is not part of the reference grammar.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Registry host, normalized (`docker.io` for Docker Hub). Empty for bare digests.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository path within the registry, e.g. `library/alpine`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Effective tag: the explicit tag, or `latest` when neither tag nor digest was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The tag exactly as written by the user.
    pub fn explicit_tag(&self) -> Option<&str> {
        self.explicit_tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// True for references that are only a content digest.
    pub fn is_digest_only(&self) -> bool {
        self.path.is_empty() && self.digest.is_some()
    }

    /// Canonical repository name, `domain/path`.
    pub fn name(&self) -> String {
        if self.domain.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{}", self.domain, self.path)
        }
    }

    /// Shortened, Docker-Hub-style name: `alpine` rather than `docker.io/library/alpine`.
    pub fn familiar_name(&self) -> String {
        if self.path.is_empty() {
            return String::new();
        }
        if self.domain == DEFAULT_DOMAIN {
            match self.path.strip_prefix(OFFICIAL_REPO_PREFIX) {
                Some(short) if !short.contains('/') => short.to_string(),
                _ => self.path.clone(),
            }
        } else {
            self.name()
        }
    }

    fn familiar_string(&self) -> String {
        let mut out = self.familiar_name();
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(&digest.to_string());
        }
        out
    }

    /// Glob-match `pattern` against the familiar form of this reference.
    ///
    /// The familiar string (with tag/digest) is tried first, then the bare
    /// familiar name. `*` and `?` never cross a `/`, and a run of `*` matches
    /// like a single one. `[^...]` negates a class; `\` escapes a character.
    pub fn familiar_match(&self, pattern: &str) -> Result<bool> {
        if self.path.is_empty() {
            return Ok(false);
        }

        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };
        let translated = glob_syntax(pattern).map_err(invalid)?;
        let compiled = glob::Pattern::new(&translated).map_err(|e| invalid(e.msg))?;
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        Ok(compiled.matches_with(&self.familiar_string(), options)
            || compiled.matches_with(&self.familiar_name(), options))
    }

    /// Short container name derived from the repository path, suffixed with
    /// the first characters of `suffix`.
    pub fn suggest_container_name(&self, suffix: &str) -> String {
        let base = if !self.path.is_empty() {
            self.path
                .rsplit('/')
                .next()
                .unwrap_or(&self.path)
                .to_string()
        } else {
            "untitled".to_string()
        };

        let suffix: String = suffix.chars().take(SHORT_ID_LENGTH).collect();
        format!("{}-{}", base, suffix)
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            return match &self.digest {
                Some(digest) => write!(f, "{}", digest),
                None => Ok(()),
            };
        }

        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Rewrite a familiar-match pattern in the syntax of the `glob` crate.
fn glob_syntax(pattern: &str) -> std::result::Result<String, &'static str> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    let mut after_star = false;

    while let Some(c) = chars.next() {
        if in_class {
            match c {
                ']' => in_class = false,
                '\\' => {
                    let escaped = chars.next().ok_or("unterminated character class")?;
                    out.push(escaped);
                    continue;
                }
                _ => {}
            }
            out.push(c);
            continue;
        }

        match c {
            '*' if after_star => continue,
            '*' => out.push('*'),
            '\\' => {
                let escaped = chars.next().ok_or("trailing backslash")?;
                out.push_str(&glob::Pattern::escape(&escaped.to_string()));
            }
            '[' => {
                in_class = true;
                out.push('[');
                if chars.next_if_eq(&'^').is_some() {
                    out.push('!');
                }
            }
            _ => out.push(c),
        }
        after_star = c == '*';
    }

    if in_class {
        return Err("unterminated character class");
    }
    Ok(out)
}

fn parse_bare_digest(raw: &str) -> Option<Digest> {
    raw.parse::<Digest>()
        .or_else(|_| format!("sha256:{}", raw).parse::<Digest>())
        .ok()
}

/// Split a familiar name into registry domain and remainder, applying Docker Hub
/// defaults.
fn split_domain(name: &str) -> (String, String) {
    let (mut domain, mut remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        remainder = format!("{}{}", OFFICIAL_REPO_PREFIX, remainder);
    }
    (domain, remainder)
}

fn parse_named(raw: &str) -> Result<ImageReference> {
    if raw.is_empty() {
        return Err(Error::invalid_reference(raw, "repository name must have at least one component"));
    }

    let (domain, remainder) = split_domain(raw);

    let repository = remainder
        .split_once(':')
        .map(|(repo, _)| repo)
        .unwrap_or(&remainder);
    let repository = repository
        .split_once('@')
        .map(|(repo, _)| repo)
        .unwrap_or(repository);
    if repository.to_lowercase() != repository {
        return Err(Error::invalid_reference(
            raw,
            format!("repository name ({}) must be lowercase", repository),
        ));
    }

    let full = format!("{}/{}", domain, remainder);
    let caps = REFERENCE_RE
        .captures(&full)
        .ok_or_else(|| Error::invalid_reference(raw, "invalid reference format"))?;

    let name = &caps[1];
    if name.len() > NAME_TOTAL_LENGTH_MAX {
        return Err(Error::invalid_reference(
            raw,
            format!("repository name must not be more than {} characters", NAME_TOTAL_LENGTH_MAX),
        ));
    }

    let path = name
        .strip_prefix(&format!("{}/", domain))
        .ok_or_else(|| Error::invalid_reference(raw, "invalid reference format"))?
        .to_string();
    let explicit_tag = caps.get(2).map(|m| m.as_str().to_string());
    let digest = caps
        .get(3)
        .map(|m| m.as_str().parse::<Digest>())
        .transpose()
        .map_err(|e| Error::invalid_reference(raw, e.to_string()))?;

    let tag = match (&explicit_tag, &digest) {
        (None, None) => Some(DEFAULT_TAG.to_string()),
        _ => explicit_tag.clone(),
    };

    Ok(ImageReference {
        protocol: None,
        domain,
        path,
        tag,
        explicit_tag,
        digest,
    })
}

/// Normalize a registry domain the way references do: empty and the legacy
/// Docker Hub host become `docker.io`.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    let domain = domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(domain)
        .trim_end_matches('/');
    match domain {
        "" | LEGACY_DEFAULT_DOMAIN => DEFAULT_DOMAIN.to_string(),
        other => other.to_string(),
    }
}
