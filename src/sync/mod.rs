//! Image synchronization between registries.
//!
//! A sync is pinned to the source digest. Single-platform images are copied
//! as fetched; multi-platform images are rebuilt at the destination as a
//! manifest list over the allowed platforms, each fetched from the source by
//! the digest its index names. Nothing is ever read back from the
//! destination, so the returned digest is always computed from content whose
//! hash was checked against the source.

use crate::auth::CredentialLookup;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::media_type;
use crate::manifest_list;
use crate::platform::{PlatformImageSet, SupportedPlatforms};
use crate::reference::{Digest, ImageReference};
use crate::registry::{ImageHandle, Registry};
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};


/// Outcome of a successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub destination: ImageReference,
    /// Digest of what was pushed, computed locally.
    pub digest: Digest,
    pub media_type: String,
    /// Platforms carried over, sorted. Empty for single-platform images.
    pub platforms: Vec<String>,
}

impl SyncResult {
    /// `destination@digest`, the identity later operations should use.
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.destination.name(), self.digest)
    }

    pub fn is_multi_platform(&self) -> bool {
        media_type::is_index(&self.media_type)
    }
}

impl fmt::Display for SyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pinned())
    }
}

/// Copies images from a source registry to a destination registry.
pub struct Synchronizer {
    source: Arc<dyn Registry>,
    destination: Arc<dyn Registry>,
    platforms: SupportedPlatforms,
}

impl Synchronizer {
    pub fn new(source: Arc<dyn Registry>, destination: Arc<dyn Registry>) -> Self {
        Self {
            source,
            destination,
            platforms: SupportedPlatforms::default(),
        }
    }

    pub fn with_platforms(mut self, platforms: SupportedPlatforms) -> Self {
        self.platforms = platforms;
        self
    }

    /// Synchronizer with HTTP clients for the registries of `source` and
    /// `destination`, credentials and retry settings taken from the arguments.
    pub async fn connect(
        source: &ImageReference,
        destination: &ImageReference,
        credentials: Arc<dyn CredentialLookup>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let source = config.connect(source.domain(), credentials.clone()).await?;
        let destination = config.connect(destination.domain(), credentials).await?;
        Ok(Self::new(Arc::new(source), Arc::new(destination))
            .with_platforms(config.supported_platforms()))
    }

    pub fn platforms(&self) -> &SupportedPlatforms {
        &self.platforms
    }

    /// Copy `source` (which must be pinned by digest) to the tag `destination`.
    ///
    /// Returns once everything is pushed, or with [`Error::Cancelled`] as soon
    /// as `cancel` fires; in-flight requests are dropped.
    pub async fn sync_image(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        check_source(source)?;
        check_destination(destination)?;

        info!(%source, %destination, "starting image sync");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.run(source, destination) => result,
        };

        match &result {
            Ok(done) => info!(
                %source,
                destination = %done.pinned(),
                platforms = done.platforms.len(),
                "image sync complete"
            ),
            Err(e) => debug!(%source, %destination, error = %e, "image sync failed"),
        }
        result.map_err(|e| e.context(format!("syncing {} to {}", source, destination)))
    }

    async fn run(&self, source: &ImageReference, destination: &ImageReference) -> Result<SyncResult> {
        let descriptor = self
            .source
            .get_descriptor(source)
            .await
            .map_err(|e| e.context("reading source manifest"))?;

        if media_type::is_index(&descriptor.media_type) {
            debug!(%source, "detected multi-platform image index");
            self.sync_multi_platform(source, destination).await
        } else {
            debug!(%source, "detected single-platform image");
            let image = self.copy_image(source, destination).await?;
            Ok(SyncResult {
                destination: destination.clone(),
                digest: image.digest().clone(),
                media_type: image.media_type().to_string(),
                platforms: Vec::new(),
            })
        }
    }

    /// Fetch `source` by digest and push that exact image to `destination`.
    /// Returns the handle that was pushed.
    async fn copy_image(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
    ) -> Result<ImageHandle> {
        let image = self
            .source
            .get_image(source)
            .await
            .map_err(|e| e.context("fetching source image"))?;
        self.destination
            .push_image(destination, &image)
            .await
            .map_err(|e| e.context("pushing image"))?;
        Ok(image)
    }

    async fn sync_multi_platform(
        &self,
        source: &ImageReference,
        destination: &ImageReference,
    ) -> Result<SyncResult> {
        let digests = self
            .source
            .get_platform_digests(source)
            .await
            .map_err(|e| e.context("reading platform digests"))?;
        debug!(platforms = digests.len(), "found platforms in source image");

        let repository = strip_tag(&source.to_string());
        let wanted: Vec<(String, ImageReference)> = digests
            .iter()
            .filter(|(platform, _)| {
                let keep = self.platforms.contains(platform);
                if !keep {
                    debug!(%platform, "skipping unsupported platform");
                }
                keep
            })
            .map(|(platform, digest)| {
                ImageReference::parse(&format!("{}@{}", repository, digest))
                    .map(|reference| (platform.clone(), reference))
            })
            .collect::<Result<_>>()?;

        if wanted.is_empty() {
            return Err(Error::NoSupportedPlatforms {
                reference: source.to_string(),
                available: digests.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        }

        let fetches = wanted.iter().map(|(platform, reference)| async move {
            debug!(%platform, %reference, "fetching platform image");
            let image = self
                .source
                .get_image(reference)
                .await
                .map_err(|e| e.context(format!("fetching platform {}", platform)))?;
            Ok::<_, Error>((platform.clone(), image))
        });
        let images = try_join_all(fetches).await?;

        let mut set = PlatformImageSet::new(self.platforms.clone());
        for (platform, image) in images {
            set.insert(platform, image);
        }
        let platforms: Vec<String> = set.platforms().map(str::to_string).collect();

        let digest = manifest_list::build_and_push(self.destination.as_ref(), destination, set)
            .await
            .map_err(|e| e.context("pushing manifest list"))?;

        Ok(SyncResult {
            destination: destination.clone(),
            digest,
            media_type: media_type::DOCKER_MANIFEST_LIST.to_string(),
            platforms,
        })
    }

    /// Whether `reference` exists at the destination. `Ok(false)` means the
    /// registry said 404; anything inconclusive is an error.
    pub async fn check_exists(&self, reference: &ImageReference) -> Result<bool> {
        self.destination
            .exists(reference)
            .await
            .map_err(|e| e.context(format!("checking whether {} exists", reference)))
    }
}

fn check_source(source: &ImageReference) -> Result<()> {
    if source.path().is_empty() {
        return Err(Error::invalid_reference(
            source.to_string(),
            "source must name a repository",
        ));
    }
    if source.digest().is_none() {
        return Err(Error::SourceDigestRequired {
            reference: source.to_string(),
        });
    }
    Ok(())
}

fn check_destination(destination: &ImageReference) -> Result<()> {
    if destination.path().is_empty() {
        return Err(Error::invalid_reference(
            destination.to_string(),
            "destination must name a repository",
        ));
    }
    if destination.digest().is_some() {
        return Err(Error::invalid_reference(
            destination.to_string(),
            "destination must be a tag, not a digest",
        ));
    }
    Ok(())
}

/// Repository part of a reference string: drops `@digest`, then a `:tag` after
/// the last `/`. A `:port` in the host is left alone.
pub fn strip_tag(reference: &str) -> String {
    let reference = match reference.find('@') {
        Some(at) => &reference[..at],
        None => reference,
    };
    for (i, c) in reference.char_indices().rev() {
        match c {
            ':' => return reference[..i].to_string(),
            '/' => break,
            _ => {}
        }
    }
    reference.to_string()
}
