//! Platform allow-lists and per-platform image sets.

use crate::registry::ImageHandle;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Linux AMD64 platform identifier
pub const LINUX_AMD64: &str = "linux/amd64";

/// Linux ARM64 platform identifier
pub const LINUX_ARM64: &str = "linux/arm64";

/// The `os/architecture` platforms a sync is allowed to carry over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedPlatforms {
    platforms: BTreeSet<String>,
}

impl SupportedPlatforms {
    pub fn new<I, S>(platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            platforms: platforms.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.platforms.contains(platform)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.platforms.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

impl Default for SupportedPlatforms {
    fn default() -> Self {
        Self::new([LINUX_AMD64, LINUX_ARM64])
    }
}

/// Fetched images keyed by `os/architecture`.
///
/// Only platforms on the allow-list are kept. Iteration is always in sorted key
/// order, which is what makes an assembled manifest list reproducible.
#[derive(Debug, Clone)]
pub struct PlatformImageSet {
    allowed: SupportedPlatforms,
    images: BTreeMap<String, ImageHandle>,
}

impl PlatformImageSet {
    pub fn new(allowed: SupportedPlatforms) -> Self {
        Self {
            allowed,
            images: BTreeMap::new(),
        }
    }

    /// Add the image for `platform`. Returns false (and drops the image) when the
    /// platform is not allowed.
    pub fn insert(&mut self, platform: impl Into<String>, image: ImageHandle) -> bool {
        let platform = platform.into();
        if !self.allowed.contains(&platform) {
            debug!(%platform, "skipping unsupported platform");
            return false;
        }
        self.images.insert(platform, image);
        true
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    /// Images in sorted platform order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ImageHandle)> {
        self.images.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn into_sorted(self) -> Vec<(String, ImageHandle)> {
        self.images.into_iter().collect()
    }
}
