//! A small in-process OCI registry for integration tests.
//!
//! Serves the distribution API subset the client uses (manifests, blobs,
//! monolithic uploads, paginated tag lists) plus a token endpoint, and can be
//! told to fail requests, require Basic or Bearer auth, or serve tampered
//! manifests.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use quark::manifest::{media_type, Descriptor, ImageIndex, ImageManifest, Platform};
use quark::Digest;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;

/// One request as seen by the server.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
struct State {
    /// `repo@digest` to (media type, bytes).
    manifests: HashMap<String, (String, Bytes)>,
    /// `repo:tag` to digest string.
    tags: HashMap<String, String>,
    blobs: HashMap<String, Bytes>,
    /// Bytes served instead of the stored manifest, by `repo@digest`.
    tampered: HashMap<String, Bytes>,
    next_upload: u64,
    requests: Vec<Seen>,
    token_scopes: Vec<String>,
    /// Statuses returned, in order, before requests are served normally.
    scripted: VecDeque<u16>,
    basic: Option<String>,
    bearer: Option<String>,
    tag_page_size: Option<usize>,
    /// Answer manifest PUTs with a digest that does not match the body.
    misreport_digests: bool,
}

pub struct FakeRegistry {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let server_state = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let state = server_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(state.clone(), addr, req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    /// `127.0.0.1:<port>`, usable as a reference domain.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn reference(&self, rest: &str) -> String {
        format!("{}/{}", self.host(), rest)
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn token_scopes(&self) -> Vec<String> {
        self.state.lock().unwrap().token_scopes.clone()
    }

    pub fn fail_next(&self, statuses: &[u16]) {
        self.state.lock().unwrap().scripted.extend(statuses.iter().copied());
    }

    pub fn require_basic(&self, username: &str, password: &str) {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        self.state.lock().unwrap().basic = Some(format!("Basic {}", encoded));
    }

    pub fn require_bearer(&self, token: &str) {
        self.state.lock().unwrap().bearer = Some(token.to_string());
    }

    pub fn paginate_tags(&self, page_size: usize) {
        self.state.lock().unwrap().tag_page_size = Some(page_size);
    }

    pub fn misreport_manifest_digests(&self) {
        self.state.lock().unwrap().misreport_digests = true;
    }

    pub fn tamper(&self, repo: &str, digest: &Digest, bytes: &'static [u8]) {
        self.state
            .lock()
            .unwrap()
            .tampered
            .insert(format!("{}@{}", repo, digest), Bytes::from_static(bytes));
    }

    /// Manifest bytes stored under `repo` for a tag or digest.
    pub fn manifest(&self, repo: &str, reference: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap();
        let digest = resolve_tag(&state, repo, reference)?;
        state
            .manifests
            .get(&format!("{}@{}", repo, digest))
            .map(|(_, bytes)| bytes.clone())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.state.lock().unwrap().blobs.contains_key(&digest.to_string())
    }

    pub fn add_tag(&self, repo: &str, tag: &str) {
        let digest = Digest::sha256_of(tag.as_bytes()).to_string();
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(format!("{}:{}", repo, tag), digest);
    }

    /// Store a one-layer image and return its manifest digest.
    pub fn add_image(&self, repo: &str, tag: Option<&str>, name: &str) -> Digest {
        let config = Bytes::from(format!(r#"{{"architecture":"{}","os":"linux","rootfs":{{}}}}"#, name));
        let layer = Bytes::from(format!("layer contents of {}", name));
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_type::OCI_MANIFEST.to_string()),
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                size: config.len() as i64,
                digest: Digest::sha256_of(&config),
                platform: None,
            },
            layers: vec![Descriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                size: layer.len() as i64,
                digest: Digest::sha256_of(&layer),
                platform: None,
            }],
        };
        {
            let mut state = self.state.lock().unwrap();
            state.blobs.insert(Digest::sha256_of(&config).to_string(), config);
            state.blobs.insert(Digest::sha256_of(&layer).to_string(), layer);
        }
        let bytes = Bytes::from(serde_json::to_vec_pretty(&manifest).unwrap());
        self.store(repo, tag, media_type::OCI_MANIFEST, bytes)
    }

    /// Store an OCI index over one image per `os/arch` key and return its digest.
    pub fn add_index(&self, repo: &str, tag: Option<&str>, platforms: &[&str]) -> Digest {
        let manifests = platforms
            .iter()
            .map(|key| {
                let digest = self.add_image(repo, None, &key.replace('/', "-"));
                let size = self.manifest(repo, &digest.to_string()).unwrap().len();
                Descriptor {
                    media_type: media_type::OCI_MANIFEST.to_string(),
                    size: size as i64,
                    digest,
                    platform: Platform::from_key(key),
                }
            })
            .collect();
        let index = ImageIndex::new(media_type::OCI_INDEX, manifests);
        let bytes = Bytes::from(serde_json::to_vec_pretty(&index).unwrap());
        self.store(repo, tag, media_type::OCI_INDEX, bytes)
    }

    fn store(&self, repo: &str, tag: Option<&str>, media_type: &str, bytes: Bytes) -> Digest {
        let digest = Digest::sha256_of(&bytes);
        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .insert(format!("{}@{}", repo, digest), (media_type.to_string(), bytes));
        if let Some(tag) = tag {
            state.tags.insert(format!("{}:{}", repo, tag), digest.to_string());
        }
        digest
    }
}

fn resolve_tag(state: &State, repo: &str, reference: &str) -> Option<String> {
    if reference.contains(':') {
        Some(reference.to_string())
    } else {
        state.tags.get(&format!("{}:{}", repo, reference)).cloned()
    }
}

fn respond(status: StatusCode, headers: &[(&str, String)], body: Bytes) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder.body(Full::new(body)).unwrap()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    respond(status, &[], Bytes::new())
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

async fn handle(
    state: Arc<Mutex<State>>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let mut state = state.lock().unwrap();
    state.requests.push(Seen {
        method: method.clone(),
        path: if query.is_empty() { path.clone() } else { format!("{}?{}", path, query) },
        authorization: authorization.clone(),
        at: Instant::now(),
    });

    if path == "/token" {
        if let Some(basic) = &state.basic {
            if authorization.as_deref() != Some(basic.as_str()) {
                return Ok(empty(StatusCode::UNAUTHORIZED));
            }
        }
        if let Some(scope) = query_param(&query, "scope") {
            state.token_scopes.push(scope.to_string());
        }
        let token = state.bearer.clone().unwrap_or_default();
        return Ok(respond(
            StatusCode::OK,
            &[("content-type", "application/json".to_string())],
            Bytes::from(format!(r#"{{"token":"{}"}}"#, token)),
        ));
    }

    if let Some(status) = state.scripted.pop_front() {
        return Ok(empty(StatusCode::from_u16(status).unwrap()));
    }

    if let Some(token) = &state.bearer {
        if authorization.as_deref() != Some(format!("Bearer {}", token).as_str()) {
            return Ok(respond(
                StatusCode::UNAUTHORIZED,
                &[(
                    "www-authenticate",
                    format!(r#"Bearer realm="http://{}/token",service="fake-registry""#, addr),
                )],
                Bytes::from_static(br#"{"errors":[{"code":"UNAUTHORIZED"}]}"#),
            ));
        }
    } else if let Some(basic) = &state.basic {
        if authorization.as_deref() != Some(basic.as_str()) {
            return Ok(respond(
                StatusCode::UNAUTHORIZED,
                &[("www-authenticate", r#"Basic realm="fake-registry""#.to_string())],
                Bytes::new(),
            ));
        }
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return Ok(empty(StatusCode::NOT_FOUND));
    };

    if let Some((repo, reference)) = rest.split_once("/manifests/") {
        return Ok(manifests(&mut state, &method, repo, reference, &content_type, body));
    }
    if let Some((repo, upload)) = rest.split_once("/blobs/uploads/") {
        return Ok(uploads(&mut state, &method, repo, upload, &query, body));
    }
    if let Some((_, digest)) = rest.split_once("/blobs/") {
        return Ok(match state.blobs.get(digest) {
            Some(_) if method == Method::HEAD => empty(StatusCode::OK),
            Some(blob) => respond(StatusCode::OK, &[], blob.clone()),
            None => empty(StatusCode::NOT_FOUND),
        });
    }
    if let Some(repo) = rest.strip_suffix("/tags/list") {
        return Ok(tags(&state, repo, &query));
    }

    Ok(empty(StatusCode::NOT_FOUND))
}

fn manifests(
    state: &mut State,
    method: &Method,
    repo: &str,
    reference: &str,
    content_type: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    if *method == Method::PUT {
        let digest = Digest::sha256_of(&body).to_string();
        if reference.contains(':') && reference != digest {
            return empty(StatusCode::BAD_REQUEST);
        }
        state
            .manifests
            .insert(format!("{}@{}", repo, digest), (content_type.to_string(), body));
        if !reference.contains(':') {
            state.tags.insert(format!("{}:{}", repo, reference), digest.clone());
        }
        let reported = if state.misreport_digests {
            Digest::sha256_of(b"not the manifest you sent").to_string()
        } else {
            digest
        };
        return respond(StatusCode::CREATED, &[("docker-content-digest", reported)], Bytes::new());
    }

    let Some(digest) = resolve_tag(state, repo, reference) else {
        return empty(StatusCode::NOT_FOUND);
    };
    let key = format!("{}@{}", repo, digest);
    let Some((media_type, bytes)) = state.manifests.get(&key).cloned() else {
        return empty(StatusCode::NOT_FOUND);
    };
    let bytes = state.tampered.get(&key).cloned().unwrap_or(bytes);
    let headers = [
        ("content-type", media_type),
        ("docker-content-digest", digest),
    ];
    if *method == Method::HEAD {
        respond(StatusCode::OK, &headers, Bytes::new())
    } else {
        respond(StatusCode::OK, &headers, bytes)
    }
}

fn uploads(
    state: &mut State,
    method: &Method,
    repo: &str,
    upload: &str,
    query: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match *method {
        Method::POST => {
            state.next_upload += 1;
            let location = format!("/v2/{}/blobs/uploads/{}?_state=opaque", repo, state.next_upload);
            respond(StatusCode::ACCEPTED, &[("location", location)], Bytes::new())
        }
        Method::PUT if !upload.is_empty() => {
            let Some(digest) = query_param(query, "digest") else {
                return empty(StatusCode::BAD_REQUEST);
            };
            if Digest::sha256_of(&body).to_string() != digest {
                return empty(StatusCode::BAD_REQUEST);
            }
            state.blobs.insert(digest.to_string(), body);
            respond(StatusCode::CREATED, &[("docker-content-digest", digest.to_string())], Bytes::new())
        }
        _ => empty(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn tags(state: &State, repo: &str, query: &str) -> Response<Full<Bytes>> {
    let prefix = format!("{}:", repo);
    let all: BTreeSet<&str> = state
        .tags
        .keys()
        .filter_map(|k| k.strip_prefix(&prefix))
        .collect();
    if all.is_empty() {
        return empty(StatusCode::NOT_FOUND);
    }

    let n = query_param(query, "n")
        .and_then(|n| n.parse().ok())
        .or(state.tag_page_size)
        .unwrap_or(usize::MAX);
    let last = query_param(query, "last");
    let page: Vec<&str> = all
        .iter()
        .copied()
        .filter(|t| last.map_or(true, |l| *t > l))
        .take(n)
        .collect();

    let mut headers = vec![("content-type", "application/json".to_string())];
    if let Some(tail) = page.last() {
        if all.iter().any(|t| t > tail) {
            headers.push((
                "link",
                format!(r#"</v2/{}/tags/list?n={}&last={}>; rel="next""#, repo, n, tail),
            ));
        }
    }
    let body = serde_json::json!({ "name": repo, "tags": page });
    respond(StatusCode::OK, &headers, Bytes::from(body.to_string()))
}
