//! HTTP plumbing: request execution with retry, and the bearer-token handshake.

use super::RetryPolicy;
use crate::auth::Credentials;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, AUTHORIZATION, WWW_AUTHENTICATE};
use hyper::{Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tracing::debug;

pub(crate) type HttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

pub(crate) fn http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpsConnector::new())
}

/// A fully read HTTP response.
#[derive(Debug)]
pub(crate) struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Status line plus the start of the body, for error messages.
    pub fn describe(&self) -> String {
        let body = String::from_utf8_lossy(&self.body);
        let body = body.trim();
        if body.is_empty() {
            self.status.to_string()
        } else {
            let snippet: String = body.chars().take(200).collect();
            format!("{}: {}", self.status, snippet)
        }
    }
}

/// A request that can be replayed for retries.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Bytes,
}

impl Call {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

/// Send `call` once, reading the whole response body.
async fn send_once(
    http: &HttpClient,
    call: &Call,
    authorization: Option<&str>,
) -> Result<Response, String> {
    let mut builder = Request::builder().method(call.method.clone()).uri(call.url.as_str());
    for (name, value) in &call.headers {
        builder = builder.header(name, value);
    }
    if let Some(auth) = authorization {
        builder = builder.header(AUTHORIZATION, auth);
    }
    let request = builder
        .body(Full::new(call.body.clone()))
        .map_err(|e| format!("invalid request {} {}: {}", call.method, call.url, e))?;

    let response = http
        .request(request)
        .await
        .map_err(|e| format!("{} {}: {}", call.method, call.url, e))?;
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| format!("reading response from {}: {}", call.url, e))?
        .to_bytes();

    Ok(Response {
        status: parts.status,
        headers: parts.headers,
        body,
    })
}

/// Send `call`, retrying retryable statuses with backoff. The last response is
/// returned whatever its status; connection failures are returned as errors.
pub(crate) async fn send_with_retry(
    http: &HttpClient,
    retry: &RetryPolicy,
    call: &Call,
    authorization: Option<&str>,
) -> Result<Response, String> {
    let mut attempt = 1;
    loop {
        let response = send_once(http, call, authorization).await?;
        if !retry.should_retry(attempt, response.status) {
            return Ok(response);
        }
        let delay = retry.delay(attempt - 1);
        debug!(
            method = %call.method,
            url = %call.url,
            status = response.status.as_u16(),
            attempt,
            ?delay,
            "retrying registry request"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
        })
    }

    /// Token endpoint URL for `scope`. The scope offered in the challenge is
    /// ignored: a push needs `pull,push` even when the first 401 came from a read.
    pub fn token_url(&self, scope: &str) -> String {
        let mut query = Vec::new();
        if let Some(service) = &self.service {
            query.push(format!("service={}", encode_query(service)));
        }
        query.push(format!("scope={}", encode_query(scope)));
        let sep = if self.realm.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.realm, sep, query.join("&"))
    }
}

/// Split `k="v", k2=v2` parameter lists, honouring commas inside quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };
        out.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

fn encode_query(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/'
            | b',' => (b as char).to_string(),
            other => format!("%{:02X}", other),
        })
        .collect()
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Authentication state for one logical registry operation.
///
/// Starts with Basic credentials (if any). On a bearer challenge a token for
/// `scope` is obtained once and used for the rest of the operation.
pub(crate) struct Session<'a> {
    http: &'a HttpClient,
    retry: &'a RetryPolicy,
    credentials: Option<&'a Credentials>,
    scope: String,
    token: Option<String>,
}

impl<'a> Session<'a> {
    pub fn new(
        http: &'a HttpClient,
        retry: &'a RetryPolicy,
        credentials: Option<&'a Credentials>,
        scope: String,
    ) -> Self {
        Self {
            http,
            retry,
            credentials,
            scope,
            token: None,
        }
    }

    fn authorization(&self) -> Option<String> {
        match &self.token {
            Some(token) => Some(format!("Bearer {}", token)),
            None => self.credentials.map(Credentials::basic_header),
        }
    }

    pub async fn send(&mut self, call: &Call) -> Result<Response, String> {
        let authorization = self.authorization();
        let response = send_with_retry(self.http, self.retry, call, authorization.as_deref()).await?;

        if response.status != StatusCode::UNAUTHORIZED || self.token.is_some() {
            return Ok(response);
        }
        let Some(challenge) = response
            .header(WWW_AUTHENTICATE)
            .and_then(BearerChallenge::parse)
        else {
            return Ok(response);
        };

        self.token = Some(self.fetch_token(&challenge).await?);
        let authorization = self.authorization();
        send_with_retry(self.http, self.retry, call, authorization.as_deref()).await
    }

    /// Send without credentials, e.g. to a storage backend a blob request redirected to.
    pub async fn send_anonymous(&self, call: &Call) -> Result<Response, String> {
        send_with_retry(self.http, self.retry, call, None).await
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<String, String> {
        let url = challenge.token_url(&self.scope);
        debug!(%url, "requesting registry token");

        let basic = self.credentials.map(Credentials::basic_header);
        let response = send_with_retry(
            self.http,
            self.retry,
            &Call::new(Method::GET, url.clone()),
            basic.as_deref(),
        )
        .await?;
        if !response.status.is_success() {
            return Err(format!("token request to {} failed: {}", url, response.describe()));
        }

        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| format!("malformed token response from {}: {}", url, e))?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| format!("token response from {} carried no token", url))
    }
}
