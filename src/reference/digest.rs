//! Content digests in `algorithm:hex` form.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash algorithms accepted in digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// A validated content digest.
///
/// The algorithm and hex payload are kept apart so a malformed digest cannot be
/// constructed; the canonical `algorithm:hex` string is produced by `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// SHA-256 digest of `data`.
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            hex: sha256::digest(data),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Hash `data` with this digest's algorithm.
    pub fn compute_like(&self, data: &[u8]) -> Result<Digest> {
        match self.algorithm {
            Algorithm::Sha256 => Ok(Self::sha256_of(data)),
            other => Err(Error::DigestComputeFailed(format!(
                "hashing with {} is not supported",
                other.name()
            ))),
        }
    }

    /// Check that `data` hashes to this digest.
    pub fn verify(&self, reference: &str, data: &[u8]) -> Result<()> {
        let actual = self.compute_like(data)?;
        if &actual != self {
            return Err(Error::DigestMismatch {
                reference: reference.to_string(),
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::invalid_reference(s, reason);

        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| invalid("digest must have the form algorithm:hex"))?;
        if algorithm.is_empty() || hex.is_empty() {
            return Err(invalid("digest must have the form algorithm:hex"));
        }
        let algorithm = Algorithm::from_name(algorithm)
            .ok_or_else(|| invalid("unsupported digest algorithm"))?;
        if hex.len() != algorithm.hex_len() {
            return Err(invalid("invalid digest length"));
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(invalid("digest must be lowercase hex"));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.hex)
    }
}
