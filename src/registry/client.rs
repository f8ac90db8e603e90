//! HTTP implementation of [`Registry`] for the OCI distribution API.

use super::transport::{self, Call, HttpClient, Response, Session};
use super::{BlobSource, ImageHandle, IndexHandle, Registry, RetryPolicy};
use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::manifest::{media_type, sniff_media_type, Descriptor, ImageManifest};
use crate::reference::{normalize_domain, Digest, ImageReference};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, LINK, LOCATION};
use hyper::{Method, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Docker Hub serves the registry API from a different host than its domain.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const MAX_REDIRECTS: usize = 5;
const MAX_TAG_PAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Registry client bound to one host and one credential pair.
///
/// Holds no per-call state, so a single client can serve any number of
/// sequential or concurrent calls. Cloning is cheap.
#[derive(Clone)]
pub struct RegistryClient {
    host: String,
    api_host: String,
    scheme: Scheme,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    http: HttpClient,
}

impl RegistryClient {
    /// Client for `host` (normalized: empty means `docker.io`).
    ///
    /// Credentials are used only when both username and password are non-empty;
    /// otherwise requests are anonymous. Loopback hosts are spoken to over plain
    /// HTTP, everything else over HTTPS.
    pub fn new(host: &str, credentials: Option<Credentials>) -> Self {
        let host = normalize_domain(host);
        let api_host = if host == crate::reference::DEFAULT_DOMAIN {
            DOCKER_HUB_API_HOST.to_string()
        } else {
            host.clone()
        };
        let scheme = if is_loopback(&host) {
            Scheme::Http
        } else {
            Scheme::Https
        };

        Self {
            host,
            api_host,
            scheme,
            credentials: credentials.filter(Credentials::is_usable),
            retry: RetryPolicy::default(),
            http: transport::http_client(),
        }
    }

    /// Speak plain HTTP to this registry.
    pub fn insecure(mut self, insecure: bool) -> Self {
        if insecure {
            self.scheme = Scheme::Http;
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    fn session(&self, repository: &str, push: bool) -> Session<'_> {
        let actions = if push { "pull,push" } else { "pull" };
        Session::new(
            &self.http,
            &self.retry,
            self.credentials.as_ref(),
            format!("repository:{}:{}", repository, actions),
        )
    }

    fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.api_host)
    }

    fn repository_url(&self, reference: &ImageReference) -> String {
        format!("{}/v2/{}", self.base_url(), reference.path())
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        let target = match (reference.digest(), reference.tag()) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.to_string(),
            (None, None) => crate::reference::DEFAULT_TAG.to_string(),
        };
        format!("{}/manifests/{}", self.repository_url(reference), target)
    }

    fn blob_url(&self, reference: &ImageReference, digest: &Digest) -> String {
        format!("{}/blobs/{}", self.repository_url(reference), digest)
    }

    /// Resolve a `Location`/`Link` target, which registries may send relative.
    fn absolute_url(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if location.starts_with('/') {
            format!("{}{}", self.base_url(), location)
        } else {
            format!("{}/{}", self.base_url(), location)
        }
    }

    /// Reject references this client cannot serve.
    fn check_reference(&self, reference: &ImageReference) -> Result<()> {
        if reference.path().is_empty() {
            return Err(Error::invalid_reference(
                reference.to_string(),
                "a repository reference is required",
            ));
        }
        if normalize_domain(reference.domain()) != self.host {
            return Err(Error::invalid_reference(
                reference.to_string(),
                format!("reference does not belong to registry {}", self.host),
            ));
        }
        Ok(())
    }

    fn manifest_call(&self, method: Method, reference: &ImageReference) -> Call {
        Call::new(method, self.manifest_url(reference)).header(ACCEPT, media_type::ACCEPT.join(", "))
    }

    /// GET a manifest and hash it. When the reference is pinned by digest the
    /// body must hash to that digest.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<(String, Bytes, Digest)> {
        self.check_reference(reference)?;
        let subject = reference.to_string();
        debug!(reference = %subject, "fetching manifest");

        let mut session = self.session(reference.path(), false);
        let response = session
            .send(&self.manifest_call(Method::GET, reference))
            .await
            .map_err(|e| Error::fetch_failed(&subject, None, e))?;
        expect_success(&response, |status, message| {
            Error::fetch_failed(&subject, status, message)
        })?;

        let digest = match reference.digest() {
            Some(expected) => {
                expected.verify(&subject, &response.body)?;
                expected.clone()
            }
            None => Digest::sha256_of(&response.body),
        };
        let media_type = manifest_media_type(&response)
            .ok_or_else(|| Error::fetch_failed(&subject, None, "unrecognized manifest media type"))?;

        Ok((media_type, response.body, digest))
    }

    async fn blob_exists(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        digest: &Digest,
    ) -> Result<bool> {
        let subject = format!("{}@{}", reference.name(), digest);
        let response = session
            .send(&Call::new(Method::HEAD, self.blob_url(reference, digest)))
            .await
            .map_err(|e| Error::push_failed(&subject, None, e))?;
        match response.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::push_failed(
                subject,
                Some(s.as_u16()),
                format!("checking blob: {}", response.describe()),
            )),
        }
    }

    async fn upload_blob(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        digest: &Digest,
        data: Bytes,
    ) -> Result<()> {
        let subject = format!("{}@{}", reference.name(), digest);
        let start = format!("{}/blobs/uploads/", self.repository_url(reference));
        let response = session
            .send(&Call::new(Method::POST, start))
            .await
            .map_err(|e| Error::push_failed(&subject, None, e))?;
        expect_success(&response, |status, message| {
            Error::push_failed(&subject, status, format!("starting upload: {}", message))
        })?;
        let location = response
            .header(LOCATION)
            .ok_or_else(|| Error::push_failed(&subject, None, "upload response had no Location"))?;

        let location = self.absolute_url(location);
        let sep = if location.contains('?') { '&' } else { '?' };
        let url = format!("{}{}digest={}", location, sep, digest);
        let response = session
            .send(
                &Call::new(Method::PUT, url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data),
            )
            .await
            .map_err(|e| Error::push_failed(&subject, None, e))?;
        expect_success(&response, |status, message| {
            Error::push_failed(&subject, status, format!("completing upload: {}", message))
        })
    }

    async fn put_manifest(
        &self,
        session: &mut Session<'_>,
        reference: &ImageReference,
        media_type: &str,
        body: &Bytes,
        digest: &Digest,
    ) -> Result<()> {
        let subject = reference.to_string();
        let response = session
            .send(
                &Call::new(Method::PUT, self.manifest_url(reference))
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone()),
            )
            .await
            .map_err(|e| Error::push_failed(&subject, None, e))?;
        expect_success(&response, |status, message| {
            Error::push_failed(&subject, status, message)
        })?;

        // Reported digest is informational only; the local one is authoritative.
        if let Some(reported) = response.header(hyper::header::HeaderName::from_static("docker-content-digest")) {
            if reported != digest.to_string() {
                warn!(
                    reference = %subject,
                    %reported,
                    computed = %digest,
                    "registry reported a different manifest digest"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn get_descriptor(&self, reference: &ImageReference) -> Result<Descriptor> {
        let (media_type, body, digest) = self.fetch_manifest(reference).await?;
        Ok(Descriptor {
            media_type,
            size: body.len() as i64,
            digest,
            platform: None,
        })
    }

    async fn get_image(&self, reference: &ImageReference) -> Result<ImageHandle> {
        let (media_type, body, _) = self.fetch_manifest(reference).await?;
        if media_type::is_index(&media_type) {
            return Err(Error::fetch_failed(
                reference.to_string(),
                None,
                format!("expected an image manifest, got {}", media_type),
            ));
        }

        let manifest: ImageManifest = serde_json::from_slice(&body).map_err(|e| {
            Error::fetch_failed(reference.to_string(), None, format!("malformed image manifest: {}", e))
        })?;
        let config = self.fetch_blob(reference, &manifest.config.digest).await?;

        ImageHandle::new(
            reference.clone(),
            media_type,
            body,
            config,
            Arc::new(self.clone()),
        )
    }

    async fn get_index(&self, reference: &ImageReference) -> Result<IndexHandle> {
        let (media_type, body, _) = self.fetch_manifest(reference).await?;
        if !media_type::is_index(&media_type) {
            return Err(Error::fetch_failed(
                reference.to_string(),
                None,
                format!("expected an image index, got {}", media_type),
            ));
        }
        IndexHandle::from_bytes(reference, media_type, body)
    }

    async fn push_image(&self, reference: &ImageReference, image: &ImageHandle) -> Result<()> {
        self.check_reference(reference)?;
        info!(
            source = %image.source(),
            destination = %reference,
            digest = %image.digest(),
            "pushing image"
        );

        let mut session = self.session(reference.path(), true);
        for descriptor in image.manifest().blobs() {
            if self.blob_exists(&mut session, reference, &descriptor.digest).await? {
                debug!(digest = %descriptor.digest, "blob already present");
                continue;
            }
            let data = image.blob(descriptor).await?;
            debug!(digest = %descriptor.digest, size = data.len(), "uploading blob");
            self.upload_blob(&mut session, reference, &descriptor.digest, data)
                .await?;
        }

        self.put_manifest(
            &mut session,
            reference,
            image.media_type(),
            image.manifest_bytes(),
            image.digest(),
        )
        .await
    }

    async fn push_index(&self, reference: &ImageReference, index: &IndexHandle) -> Result<()> {
        self.check_reference(reference)?;

        for child in index.children() {
            let child_ref = ImageReference::parse(&format!("{}@{}", reference.name(), child.digest()))?;
            self.push_image(&child_ref, child).await?;
        }

        info!(
            destination = %reference,
            digest = %index.digest(),
            manifests = index.index().manifests.len(),
            "pushing image index"
        );
        let mut session = self.session(reference.path(), true);
        self.put_manifest(
            &mut session,
            reference,
            index.media_type(),
            index.manifest_bytes(),
            index.digest(),
        )
        .await
    }

    async fn exists(&self, reference: &ImageReference) -> Result<bool> {
        self.check_reference(reference)?;
        let subject = reference.to_string();

        let mut session = self.session(reference.path(), false);
        let response = session
            .send(&self.manifest_call(Method::HEAD, reference))
            .await
            .map_err(|e| Error::fetch_failed(&subject, None, e))?;
        match response.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::fetch_failed(
                subject,
                Some(s.as_u16()),
                format!("checking existence: {}", response.describe()),
            )),
        }
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let reference = ImageReference::parse(repository)?;
        self.check_reference(&reference)?;
        let subject = reference.name();

        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let mut session = self.session(reference.path(), false);
        let mut url = format!("{}/tags/list", self.repository_url(&reference));
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let response = session
                .send(&Call::new(Method::GET, url.clone()))
                .await
                .map_err(|e| Error::fetch_failed(&subject, None, e))?;
            expect_success(&response, |status, message| {
                Error::fetch_failed(&subject, status, format!("listing tags: {}", message))
            })?;

            let page: TagList = serde_json::from_slice(&response.body).map_err(|e| {
                Error::fetch_failed(&subject, None, format!("malformed tag list: {}", e))
            })?;
            tags.extend(page.tags.unwrap_or_default());

            match response.header(LINK).and_then(next_link) {
                Some(next) => url = self.absolute_url(next),
                None => return Ok(tags),
            }
        }

        Err(Error::fetch_failed(subject, None, "tag list pagination did not terminate"))
    }
}

#[async_trait]
impl BlobSource for RegistryClient {
    /// GET a blob, following redirects to storage backends, and verify its digest.
    async fn fetch_blob(&self, repository: &ImageReference, digest: &Digest) -> Result<Bytes> {
        self.check_reference(repository)?;
        let subject = format!("{}@{}", repository.name(), digest);
        debug!(blob = %subject, "fetching blob");

        let mut session = self.session(repository.path(), false);
        let mut response = session
            .send(&Call::new(Method::GET, self.blob_url(repository, digest)))
            .await
            .map_err(|e| Error::fetch_failed(&subject, None, e))?;

        for _ in 0..MAX_REDIRECTS {
            if !response.status.is_redirection() {
                break;
            }
            let Some(location) = response.header(LOCATION) else {
                break;
            };
            let target = self.absolute_url(location);
            debug!(%target, "following blob redirect");
            response = session
                .send_anonymous(&Call::new(Method::GET, target))
                .await
                .map_err(|e| Error::fetch_failed(&subject, None, e))?;
        }

        expect_success(&response, |status, message| {
            Error::fetch_failed(&subject, status, message)
        })?;
        digest.verify(&subject, &response.body)?;
        Ok(response.body)
    }
}

fn expect_success(
    response: &Response,
    error: impl FnOnce(Option<u16>, String) -> Error,
) -> Result<()> {
    if response.status.is_success() {
        Ok(())
    } else {
        Err(error(Some(response.status.as_u16()), response.describe()))
    }
}

/// Media type from `Content-Type`, falling back to the body when the header is
/// missing or generic.
fn manifest_media_type(response: &Response) -> Option<String> {
    let header = response
        .header(CONTENT_TYPE)
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());
    match header {
        Some(mt) if media_type::is_index(&mt) || media_type::is_image(&mt) => Some(mt),
        _ => sniff_media_type(&response.body),
    }
}

/// Target of a `Link: <url>; rel="next"` header.
pub(crate) fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|link| {
        let (target, params) = link.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace('"', "") == "rel=next");
        if !is_next {
            return None;
        }
        target.trim().strip_prefix('<')?.strip_suffix('>')
    })
}

fn is_loopback(host: &str) -> bool {
    let hostname = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    hostname == "localhost" || hostname == "::1" || hostname.starts_with("127.")
}

#[cfg(test)]
pub(crate) fn is_loopback_host(host: &str) -> bool {
    is_loopback(host)
}
