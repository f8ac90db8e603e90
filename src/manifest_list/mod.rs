//! Deterministic manifest-list assembly.
//!
//! Entries are emitted in sorted platform-key order, and the digest is a local
//! hash of the exact bytes pushed, never a value read back from the registry.

use crate::error::{Error, Result};
use crate::manifest::{media_type, Descriptor, ImageIndex, Platform};
use crate::platform::PlatformImageSet;
use crate::reference::{Digest, ImageReference};
use crate::registry::{IndexHandle, Registry};
use bytes::Bytes;
use tracing::{debug, info};


/// Build a Docker manifest list over every image in `set`, children included.
pub fn assemble(set: PlatformImageSet) -> Result<IndexHandle> {
    let mut manifests = Vec::with_capacity(set.len());
    let mut children = Vec::with_capacity(set.len());

    for (key, image) in set.into_sorted() {
        let platform = Platform::from_key(&key).ok_or_else(|| {
            Error::DigestComputeFailed(format!("platform key '{}' is not os/architecture", key))
        })?;
        debug!(platform = %key, digest = %image.digest(), "adding manifest list entry");
        manifests.push(Descriptor {
            media_type: image.media_type().to_string(),
            size: image.size(),
            digest: image.digest().clone(),
            platform: Some(platform),
        });
        children.push(image);
    }

    let index = ImageIndex::new(media_type::DOCKER_MANIFEST_LIST, manifests);
    let bytes = serde_json::to_vec(&index)
        .map_err(|e| Error::DigestComputeFailed(format!("serializing manifest list: {}", e)))?;

    Ok(IndexHandle::assembled(index, Bytes::from(bytes), children))
}

/// Assemble the manifest list for `set`, push it to `destination`, and return
/// its locally computed digest.
pub async fn build_and_push(
    registry: &dyn Registry,
    destination: &ImageReference,
    set: PlatformImageSet,
) -> Result<Digest> {
    let index = assemble(set)?;
    let digest = index.digest().clone();

    registry.push_index(destination, &index).await?;

    info!(
        destination = %destination,
        %digest,
        platforms = index.index().manifests.len(),
        "pushed manifest list"
    );
    Ok(digest)
}
