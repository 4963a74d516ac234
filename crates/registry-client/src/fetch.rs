//! Authenticated requests with a single refresh on 401
//!
//! Registry tokens are opaque and short-lived, so the client cannot know
//! when one expires. The first 401 is taken as a request to refresh. A second
//! one means the credential really lacks access, and the request fails.

use crate::errors::{describe_error_body, RegistryError, Result};
use crate::secrets::{Authenticable, Credential};
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Method, StatusCode};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

/// Something that can hand out a credential and throw it away again.
#[async_trait]
pub trait CredentialProvider: Send {
    /// The credential for the next request, obtaining a new one if none is
    /// held. `None` means the request goes out anonymously.
    async fn credential(&mut self) -> Result<Option<Credential>>;

    /// Drops the held credential. Returns `false` when it cannot be
    /// replaced, in which case a 401 is final.
    fn invalidate(&mut self) -> bool;
}

/// Where a successful response body goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Keep the body in memory
    Memory,
    /// Stream the body into this file, replacing it
    File(PathBuf),
}

/// One request, unchanged across attempts.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// HTTP method
    pub method: Method,
    /// Target URL
    pub url: String,
    /// Media types listed in the `Accept` header
    pub accept: Vec<String>,
    /// Where the body of a successful response goes
    pub destination: Destination,
    /// Request body, sent again on retry
    pub body: Option<Vec<u8>>,
}

impl RequestContext {
    /// A GET whose body is kept in memory.
    pub fn get(url: impl Into<String>) -> Self {
        RequestContext {
            method: Method::GET,
            url: url.into(),
            accept: Vec::new(),
            destination: Destination::Memory,
            body: None,
        }
    }

    /// A PUT carrying `body`.
    pub fn put(url: impl Into<String>, body: Vec<u8>) -> Self {
        RequestContext {
            method: Method::PUT,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Sets the accepted media types.
    pub fn accept<S: AsRef<str>>(mut self, media_types: &[S]) -> Self {
        self.accept = media_types.iter().map(|m| m.as_ref().to_owned()).collect();
        self
    }

    /// Streams a successful body into `path`.
    pub fn into_file(mut self, path: impl AsRef<Path>) -> Self {
        self.destination = Destination::File(path.as_ref().to_path_buf());
        self
    }
}

/// The body of a successful response
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchedBody {
    /// The body, read into memory
    Bytes(Vec<u8>),
    /// The body was written to `path`
    File {
        /// Where the body was written
        path: PathBuf,
        /// Number of bytes written
        size: u64,
    },
}

/// A successful response
#[derive(Debug)]
pub struct FetchResponse {
    /// Final status, always a success code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// The body, in memory or on disk
    pub body: FetchedBody,
}

impl FetchResponse {
    /// The in-memory body, or an empty slice when it went to a file.
    pub fn bytes(&self) -> &[u8] {
        match &self.body {
            FetchedBody::Bytes(b) => b,
            FetchedBody::File { .. } => &[],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    First,
    Second,
}

/// Sends `request`, refreshing the credential at most once.
///
/// 1. Ask the provider for a credential; failure ends the fetch with
///    [`RegistryError::CredentialUnavailable`].
/// 2. Send the request with it.
/// 3. On success, return the response.
/// 4. On the first 401, if the provider can refresh, drop the credential and
///    go again.
/// 5. Anything else fails with [`RegistryError::HttpStatus`].
pub async fn fetch_with_retry<P: CredentialProvider + ?Sized>(
    http: &reqwest::Client,
    request: &RequestContext,
    provider: &mut P,
) -> Result<FetchResponse> {
    let mut attempt = Attempt::First;
    loop {
        let credential =
            provider
                .credential()
                .await
                .map_err(|e| RegistryError::CredentialUnavailable {
                    url: request.url.clone(),
                    source: Box::new(e),
                })?;

        debug!(method = %request.method, url = %request.url, ?attempt, "Sending request");
        let res = build(http, request, credential.as_ref()).send().await?;
        let status = res.status();
        trace!(headers = ?res.headers(), %status, "Got Headers");

        if status.is_success() {
            let headers = res.headers().clone();
            let body = read_body(res, &request.destination).await?;
            return Ok(FetchResponse {
                status,
                headers,
                body,
            });
        }

        if status == StatusCode::UNAUTHORIZED && attempt == Attempt::First && provider.invalidate()
        {
            warn!(url = %request.url, "Unauthorized; refreshing the token and retrying once");
            attempt = Attempt::Second;
            continue;
        }

        let text = res.text().await.unwrap_or_default();
        return Err(RegistryError::HttpStatus {
            method: request.method.to_string(),
            url: request.url.clone(),
            status,
            message: describe_error_body(&text),
        });
    }
}

fn build(
    http: &reqwest::Client,
    request: &RequestContext,
    credential: Option<&Credential>,
) -> reqwest::RequestBuilder {
    let mut builder = http
        .request(request.method.clone(), &request.url)
        .apply_authentication(credential);
    if !request.accept.is_empty() {
        builder = builder.header(ACCEPT, request.accept.join(", "));
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }
    builder
}

async fn read_body(res: reqwest::Response, destination: &Destination) -> Result<FetchedBody> {
    match destination {
        Destination::Memory => Ok(FetchedBody::Bytes(res.bytes().await?.to_vec())),
        Destination::File(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            let mut stream = res.bytes_stream();
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            debug!(path = %path.display(), %size, "Wrote response body");
            Ok(FetchedBody::File {
                path: path.clone(),
                size,
            })
        }
    }
}
