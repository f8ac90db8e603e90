//! In-memory registry used by unit tests.

use super::{BlobSource, ImageHandle, IndexHandle, Registry};
use crate::error::{Error, Result};
use crate::manifest::{media_type, Descriptor, ImageIndex, ImageManifest, Platform};
use crate::reference::{Digest, ImageReference};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blobs keyed by digest.
#[derive(Default)]
pub(crate) struct MemoryBlobs {
    blobs: Mutex<HashMap<Digest, Bytes>>,
}

impl MemoryBlobs {
    pub fn put(&self, data: Bytes) -> Digest {
        let digest = Digest::sha256_of(&data);
        self.blobs.lock().unwrap().insert(digest.clone(), data);
        digest
    }
}

#[async_trait]
impl BlobSource for MemoryBlobs {
    async fn fetch_blob(&self, repository: &ImageReference, digest: &Digest) -> Result<Bytes> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::fetch_failed(format!("{}@{}", repository.name(), digest), Some(404), "blob unknown"))
    }
}

/// Manifest, config and one layer for a tiny image whose content depends on `name`.
pub(crate) fn image_parts(name: &str) -> (Bytes, Bytes, Bytes) {
    let config = Bytes::from(format!(r#"{{"architecture":"{}","os":"linux"}}"#, name));
    let layer = Bytes::from(format!("layer for {}", name));
    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(media_type::DOCKER_MANIFEST.to_string()),
        config: Descriptor {
            media_type: "application/vnd.docker.container.image.v1+json".to_string(),
            size: config.len() as i64,
            digest: Digest::sha256_of(&config),
            platform: None,
        },
        layers: vec![Descriptor {
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
            size: layer.len() as i64,
            digest: Digest::sha256_of(&layer),
            platform: None,
        }],
    };
    let manifest = Bytes::from(serde_json::to_vec(&manifest).unwrap());
    (manifest, config, layer)
}

/// A standalone image handle whose layers live in a private blob store.
pub(crate) fn image_handle(name: &str) -> ImageHandle {
    let (manifest, config, layer) = image_parts(name);
    let blobs = MemoryBlobs::default();
    blobs.put(config.clone());
    blobs.put(layer);
    ImageHandle::new(
        ImageReference::parse(&format!("test.io/images/{}", name)).unwrap(),
        media_type::DOCKER_MANIFEST,
        manifest,
        config,
        Arc::new(blobs),
    )
    .unwrap()
}

/// A call recorded by [`FakeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    GetDescriptor(String),
    GetImage(String),
    GetIndex(String),
    PushImage(String),
    PushIndex(String),
    Exists(String),
    ListTags(String),
}

#[derive(Default)]
struct State {
    /// Manifest bytes and media type by `name@digest`.
    manifests: HashMap<String, (String, Bytes)>,
    /// Manifest digest by `name:tag`.
    tags: HashMap<String, Digest>,
    calls: Vec<Call>,
    /// Index bytes stored on push, by reference string.
    pushed_indexes: HashMap<String, Bytes>,
    pushed_images: HashMap<String, Digest>,
}

/// Registry double holding manifests in memory and recording every call.
///
/// Configurable failure modes: rewrite the bytes served for a digest (a
/// tampering registry), fail pushes, or delay every call.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    state: Mutex<State>,
    blobs: Arc<MemoryBlobs>,
    tampered: Mutex<HashMap<String, Bytes>>,
    fail_push: Mutex<Option<u16>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn pushed_index(&self, reference: &str) -> Option<Bytes> {
        self.state.lock().unwrap().pushed_indexes.get(reference).cloned()
    }

    pub fn pushed_images(&self) -> HashMap<String, Digest> {
        self.state.lock().unwrap().pushed_images.clone()
    }

    pub fn fail_pushes(&self, status: u16) {
        *self.fail_push.lock().unwrap() = Some(status);
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Serve `bytes` instead of the stored manifest for `name@digest`.
    pub fn tamper(&self, name: &str, digest: &Digest, bytes: Bytes) {
        self.tampered
            .lock()
            .unwrap()
            .insert(format!("{}@{}", name, digest), bytes);
    }

    /// Store a single-platform image under `name` and return its digest.
    pub fn add_image(&self, name: &str, tag: Option<&str>, image: &str) -> Digest {
        let (manifest, config, layer) = image_parts(image);
        self.blobs.put(config);
        self.blobs.put(layer);
        self.add_manifest(name, tag, media_type::DOCKER_MANIFEST, manifest)
    }

    /// Store a manifest list of images, one per `os/arch` key, and return its digest.
    pub fn add_index(&self, name: &str, tag: Option<&str>, platforms: &[&str]) -> Digest {
        let manifests = platforms
            .iter()
            .map(|key| {
                let image = key.replace('/', "-");
                let digest = self.add_image(name, None, &image);
                let size = self.manifest(name, &digest).map(|(_, b)| b.len()).unwrap_or(0);
                Descriptor {
                    media_type: media_type::DOCKER_MANIFEST.to_string(),
                    size: size as i64,
                    digest,
                    platform: Platform::from_key(key),
                }
            })
            .collect();
        let index = ImageIndex::new(media_type::DOCKER_MANIFEST_LIST, manifests);
        let bytes = Bytes::from(serde_json::to_vec(&index).unwrap());
        self.add_manifest(name, tag, media_type::DOCKER_MANIFEST_LIST, bytes)
    }

    fn add_manifest(&self, name: &str, tag: Option<&str>, media_type: &str, bytes: Bytes) -> Digest {
        let digest = Digest::sha256_of(&bytes);
        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .insert(format!("{}@{}", name, digest), (media_type.to_string(), bytes));
        if let Some(tag) = tag {
            state.tags.insert(format!("{}:{}", name, tag), digest.clone());
        }
        digest
    }

    fn manifest(&self, name: &str, digest: &Digest) -> Option<(String, Bytes)> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&format!("{}@{}", name, digest))
            .cloned()
    }

    async fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Resolve `reference` to served bytes, applying tampering.
    fn resolve(&self, reference: &ImageReference) -> Result<(String, Bytes)> {
        let name = reference.name();
        let digest = match reference.digest() {
            Some(d) => d.clone(),
            None => {
                let tag = reference.tag().unwrap_or("latest");
                self.state
                    .lock()
                    .unwrap()
                    .tags
                    .get(&format!("{}:{}", name, tag))
                    .cloned()
                    .ok_or_else(|| Error::fetch_failed(reference.to_string(), Some(404), "manifest unknown"))?
            }
        };
        let (media_type, bytes) = self
            .manifest(&name, &digest)
            .ok_or_else(|| Error::fetch_failed(reference.to_string(), Some(404), "manifest unknown"))?;
        let key = format!("{}@{}", name, digest);
        let bytes = self.tampered.lock().unwrap().get(&key).cloned().unwrap_or(bytes);
        if let Some(expected) = reference.digest() {
            expected.verify(&reference.to_string(), &bytes)?;
        }
        Ok((media_type, bytes))
    }

    fn check_push(&self, reference: &ImageReference) -> Result<()> {
        match *self.fail_push.lock().unwrap() {
            Some(status) => Err(Error::push_failed(reference.to_string(), Some(status), "push rejected")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn get_descriptor(&self, reference: &ImageReference) -> Result<Descriptor> {
        self.record(Call::GetDescriptor(reference.to_string())).await;
        let (media_type, bytes) = self.resolve(reference)?;
        Ok(Descriptor {
            media_type,
            size: bytes.len() as i64,
            digest: Digest::sha256_of(&bytes),
            platform: None,
        })
    }

    async fn get_image(&self, reference: &ImageReference) -> Result<ImageHandle> {
        self.record(Call::GetImage(reference.to_string())).await;
        let (media_type, bytes) = self.resolve(reference)?;
        if media_type::is_index(&media_type) {
            return Err(Error::fetch_failed(reference.to_string(), None, "not an image"));
        }
        let manifest: ImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::fetch_failed(reference.to_string(), None, e.to_string()))?;
        let config = self.blobs.fetch_blob(reference, &manifest.config.digest).await?;
        ImageHandle::new(reference.clone(), media_type, bytes, config, self.blobs.clone())
    }

    async fn get_index(&self, reference: &ImageReference) -> Result<IndexHandle> {
        self.record(Call::GetIndex(reference.to_string())).await;
        let (media_type, bytes) = self.resolve(reference)?;
        IndexHandle::from_bytes(reference, media_type, bytes)
    }

    async fn push_image(&self, reference: &ImageReference, image: &ImageHandle) -> Result<()> {
        self.record(Call::PushImage(reference.to_string())).await;
        self.check_push(reference)?;
        for blob in image.manifest().blobs() {
            let data = image.blob(blob).await?;
            self.blobs.put(data);
        }
        let name = reference.name();
        let digest = self.add_manifest(
            &name,
            reference.tag(),
            image.media_type(),
            image.manifest_bytes().clone(),
        );
        self.state
            .lock()
            .unwrap()
            .pushed_images
            .insert(reference.to_string(), digest);
        Ok(())
    }

    async fn push_index(&self, reference: &ImageReference, index: &IndexHandle) -> Result<()> {
        self.record(Call::PushIndex(reference.to_string())).await;
        self.check_push(reference)?;
        let name = reference.name();
        for child in index.children() {
            let child_ref = ImageReference::parse(&format!("{}@{}", name, child.digest()))?;
            self.push_image(&child_ref, child).await?;
        }
        self.add_manifest(
            &name,
            reference.tag(),
            index.media_type(),
            index.manifest_bytes().clone(),
        );
        self.state
            .lock()
            .unwrap()
            .pushed_indexes
            .insert(reference.to_string(), index.manifest_bytes().clone());
        Ok(())
    }

    async fn exists(&self, reference: &ImageReference) -> Result<bool> {
        self.record(Call::Exists(reference.to_string())).await;
        match self.resolve(reference) {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.record(Call::ListTags(repository.to_string())).await;
        let prefix = format!("{}:", ImageReference::parse(repository)?.name());
        let tags: BTreeMap<String, ()> = self
            .state
            .lock()
            .unwrap()
            .tags
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(|t| (t.to_string(), ())))
            .collect();
        Ok(tags.into_keys().collect())
    }
}
