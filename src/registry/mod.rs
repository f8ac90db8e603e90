//! OCI registry access.
//!
//! [`Registry`] is the verb set the synchronizer needs; [`RegistryClient`] is the
//! HTTP implementation speaking the OCI distribution API. Image and index
//! handles carry the exact manifest bytes they were fetched or assembled from,
//! so digests are always computed locally from content we hold.

use crate::error::{Error, Result};
use crate::manifest::{media_type, Descriptor, ImageIndex, ImageManifest};
use crate::reference::{Digest, ImageReference};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

mod client;
mod retry;
mod transport;

pub use client::RegistryClient;
pub use retry::RetryPolicy;

#[cfg(test)]
pub(crate) mod testing;


/// Registry operations used by sync, version checks and scans.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Media type, digest and size of the manifest `reference` resolves to.
    async fn get_descriptor(&self, reference: &ImageReference) -> Result<Descriptor>;

    /// Fetch a single-platform image (manifest and config; layers on demand).
    async fn get_image(&self, reference: &ImageReference) -> Result<ImageHandle>;

    /// Fetch a multi-platform image index.
    async fn get_index(&self, reference: &ImageReference) -> Result<IndexHandle>;

    /// `os/architecture` to manifest digest, read from the index at `reference`.
    async fn get_platform_digests(
        &self,
        reference: &ImageReference,
    ) -> Result<BTreeMap<String, Digest>> {
        Ok(self.get_index(reference).await?.platform_digests())
    }

    /// Digest of the manifest `reference` resolves to.
    async fn get_digest(&self, reference: &ImageReference) -> Result<Digest> {
        Ok(self.get_descriptor(reference).await?.digest)
    }

    async fn push_image(&self, reference: &ImageReference, image: &ImageHandle) -> Result<()>;

    /// Push every child image by digest, then the index itself.
    async fn push_index(&self, reference: &ImageReference, index: &IndexHandle) -> Result<()>;

    /// `Ok(false)` only when the registry answers 404; any other failure is an error.
    async fn exists(&self, reference: &ImageReference) -> Result<bool>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;
}

/// Where the layer blobs of an image can be read from.
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn fetch_blob(&self, repository: &ImageReference, digest: &Digest) -> Result<Bytes>;
}

/// A single-platform image held in memory: manifest bytes and config, with
/// layers streamed from the registry it came from when a push needs them.
#[derive(Clone)]
pub struct ImageHandle {
    source: ImageReference,
    media_type: String,
    manifest_bytes: Bytes,
    digest: Digest,
    manifest: ImageManifest,
    config: Bytes,
    blobs: Arc<dyn BlobSource>,
}

impl ImageHandle {
    /// Build a handle from fetched content. The config blob is checked against
    /// the digest the manifest names.
    pub fn new(
        source: ImageReference,
        media_type: impl Into<String>,
        manifest_bytes: Bytes,
        config: Bytes,
        blobs: Arc<dyn BlobSource>,
    ) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            Error::fetch_failed(source.to_string(), None, format!("malformed image manifest: {}", e))
        })?;
        manifest
            .config
            .digest
            .verify(&format!("{} (config)", source), &config)?;

        Ok(Self {
            digest: Digest::sha256_of(&manifest_bytes),
            source,
            media_type: media_type.into(),
            manifest_bytes,
            manifest,
            config,
            blobs,
        })
    }

    /// The reference this image was fetched by.
    pub fn source(&self) -> &ImageReference {
        &self.source
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Digest of the manifest bytes, computed locally.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn manifest_bytes(&self) -> &Bytes {
        &self.manifest_bytes
    }

    pub fn size(&self) -> i64 {
        self.manifest_bytes.len() as i64
    }

    /// Content of a blob referenced by this image, verified against its digest.
    pub async fn blob(&self, descriptor: &Descriptor) -> Result<Bytes> {
        if descriptor.digest == self.manifest.config.digest {
            return Ok(self.config.clone());
        }
        let data = self.blobs.fetch_blob(&self.source, &descriptor.digest).await?;
        descriptor
            .digest
            .verify(&format!("{}@{}", self.source.name(), descriptor.digest), &data)?;
        Ok(data)
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageHandle")
            .field("source", &self.source.to_string())
            .field("media_type", &self.media_type)
            .field("digest", &self.digest.to_string())
            .field("layers", &self.manifest.layers.len())
            .finish()
    }
}

/// A multi-platform index held in memory, optionally with the child images it
/// references (needed to push it somewhere new).
#[derive(Debug, Clone)]
pub struct IndexHandle {
    media_type: String,
    manifest_bytes: Bytes,
    digest: Digest,
    index: ImageIndex,
    children: Vec<ImageHandle>,
}

impl IndexHandle {
    /// Parse fetched index bytes. The handle has no children.
    pub fn from_bytes(
        reference: &ImageReference,
        media_type: impl Into<String>,
        manifest_bytes: Bytes,
    ) -> Result<Self> {
        let index: ImageIndex = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            Error::fetch_failed(reference.to_string(), None, format!("malformed image index: {}", e))
        })?;
        Ok(Self {
            media_type: media_type.into(),
            digest: Digest::sha256_of(&manifest_bytes),
            manifest_bytes,
            index,
            children: Vec::new(),
        })
    }

    /// An index assembled locally; `manifest_bytes` must be the serialization of `index`.
    pub(crate) fn assembled(
        index: ImageIndex,
        manifest_bytes: Bytes,
        children: Vec<ImageHandle>,
    ) -> Self {
        Self {
            media_type: index
                .media_type
                .clone()
                .unwrap_or_else(|| media_type::OCI_INDEX.to_string()),
            digest: Digest::sha256_of(&manifest_bytes),
            manifest_bytes,
            index,
            children,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Digest of the index bytes, computed locally.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn manifest_bytes(&self) -> &Bytes {
        &self.manifest_bytes
    }

    pub fn children(&self) -> &[ImageHandle] {
        &self.children
    }

    /// `os/architecture` to digest for every entry that declares a platform.
    /// Later entries win when two share a key (e.g. `arm/v6` and `arm/v7`).
    pub fn platform_digests(&self) -> BTreeMap<String, Digest> {
        self.index
            .manifests
            .iter()
            .filter_map(|m| m.platform.as_ref().map(|p| (p.key(), m.digest.clone())))
            .collect()
    }
}
