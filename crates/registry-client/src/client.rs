//! Registry and package API client
//!
//! The client knows the URL layout of the registry and of GitLab's generic
//! package API. Every request goes through [`fetch_with_retry`] with the
//! caller's [`AuthSession`], so token refresh works the same everywhere.

use crate::errors::{RegistryError, Result};
use crate::fetch::{fetch_with_retry, FetchResponse, FetchedBody, RequestContext};
use crate::manifest::MIME_TYPES_DISTRIBUTION_MANIFEST;
use crate::secrets::LongLivedCredential;
use crate::session::{AuthSession, SessionOptions};
use crate::Reference;

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::Url;
use sha2::Digest;
use std::convert::TryFrom;
use std::path::Path;
use tracing::{debug, info, warn};

/// Scope requested for package uploads unless the operator narrows it.
pub const DEFAULT_PACKAGE_SCOPE: &str = "api";

/// A manifest as returned by the registry
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// Raw body, saved to disk unchanged
    pub body: Vec<u8>,
    /// The response `Content-Type`, if any
    pub content_type: Option<String>,
    /// `Docker-Content-Digest`, or the sha256 of the body
    pub digest: String,
}

/// Coordinates of a generic package file
#[derive(Debug, Clone)]
pub struct GenericPackage {
    /// Numeric project id or `group/project` path
    pub project: String,
    /// Package name
    pub name: String,
    /// Package version
    pub version: String,
    /// File name inside the package
    pub file_name: String,
}

/// Talks to one registry or GitLab instance.
#[derive(Default)]
pub struct Client {
    config: ClientConfig,
    client: reqwest::Client,
}

impl TryFrom<ClientConfig> for Client {
    type Error = RegistryError;

    fn try_from(config: ClientConfig) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certificates);
        if let Some(agent) = &config.user_agent {
            client_builder = client_builder.user_agent(agent.as_str());
        }

        for c in &config.extra_root_certificates {
            let cert = match c.encoding {
                CertificateEncoding::Der => reqwest::Certificate::from_der(c.data.as_slice())?,
                CertificateEncoding::Pem => reqwest::Certificate::from_pem(c.data.as_slice())?,
            };
            client_builder = client_builder.add_root_certificate(cert);
        }

        Ok(Self {
            config,
            client: client_builder.build()?,
        })
    }
}

impl Client {
    /// Create a new client with the supplied config
    pub fn new(config: ClientConfig) -> Self {
        Client::try_from(config.clone()).unwrap_or_else(|err| {
            warn!("Cannot create client from config: {:?}", err);
            warn!("Creating client with default configuration");
            Self {
                config,
                client: reqwest::Client::new(),
            }
        })
    }

    /// The underlying HTTP client.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sets up authentication for pulling `image`.
    ///
    /// Probes `/v2/` on the registry unless `options` already decide the
    /// mode, and asks for `repository:<path>:pull`.
    pub async fn registry_session(
        &self,
        image: &Reference,
        credential: Option<LongLivedCredential>,
        options: &SessionOptions,
    ) -> AuthSession {
        let probe = self.to_v2_base_url(image.registry());
        AuthSession::bootstrap(
            self.client.clone(),
            &probe,
            credential,
            &image.pull_scope(),
            options,
        )
        .await
    }

    /// Sets up authentication for the GitLab API on `host`.
    ///
    /// The broad default scope (`api`) is kept for compatibility but reported,
    /// as an upload needs much less.
    pub async fn package_session(
        &self,
        host: &str,
        credential: Option<LongLivedCredential>,
        scope: Option<&str>,
        options: &SessionOptions,
    ) -> AuthSession {
        let scope = scope.unwrap_or_else(|| {
            warn!(
                scope = DEFAULT_PACKAGE_SCOPE,
                "Requesting the broad default token scope; pass a narrower scope if the token endpoint allows it"
            );
            DEFAULT_PACKAGE_SCOPE
        });
        let probe = self.to_api_version_url(host);
        AuthSession::bootstrap(self.client.clone(), &probe, credential, scope, options).await
    }

    /// Pull a manifest (or manifest list) from the registry.
    pub async fn pull_manifest(
        &self,
        session: &mut AuthSession,
        image: &Reference,
    ) -> Result<FetchedManifest> {
        let url = self.to_v2_manifest_url(image);
        debug!("Pulling image manifest from {}", url);
        let request = RequestContext::get(url).accept(MIME_TYPES_DISTRIBUTION_MANIFEST);
        let res = fetch_with_retry(&self.client, &request, session).await?;

        let content_type = res
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = res.bytes().to_vec();
        let digest = digest_header_value(&res.headers, &body)?;
        Ok(FetchedManifest {
            body,
            content_type,
            digest,
        })
    }

    /// Pull a blob straight into a file. Returns the number of bytes written.
    pub async fn pull_blob_to_file(
        &self,
        session: &mut AuthSession,
        image: &Reference,
        digest: &str,
        path: &Path,
    ) -> Result<u64> {
        let url = self.to_v2_blob_url(image.registry(), image.repository(), digest);
        debug!(path = %path.display(), "Pulling blob from {}", url);
        let request = RequestContext::get(url).into_file(path);
        match fetch_with_retry(&self.client, &request, session).await?.body {
            FetchedBody::File { size, .. } => Ok(size),
            FetchedBody::Bytes(b) => Ok(b.len() as u64),
        }
    }

    /// Uploads `data` as a generic package file.
    pub async fn push_generic_package(
        &self,
        session: &mut AuthSession,
        host: &str,
        package: &GenericPackage,
        data: Vec<u8>,
    ) -> Result<FetchResponse> {
        let url = self.to_generic_package_url(host, package)?;
        info!(
            %url,
            size = data.len(),
            digest = %sha256_digest(&data),
            "Uploading generic package file"
        );
        fetch_with_retry(&self.client, &RequestContext::put(url, data), session).await
    }

    fn to_v2_base_url(&self, registry: &str) -> String {
        format!("{}://{}/v2/", self.config.protocol.scheme_for(registry), registry)
    }

    /// Convert a Reference to a v2 manifest URL.
    fn to_v2_manifest_url(&self, reference: &Reference) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.config.protocol.scheme_for(reference.registry()),
            reference.registry(),
            reference.repository(),
            reference.tag_or_digest(),
        )
    }

    /// Convert a Reference to a v2 blob (layer) URL.
    fn to_v2_blob_url(&self, registry: &str, repository: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.config.protocol.scheme_for(registry),
            registry,
            repository,
            digest,
        )
    }

    fn to_api_version_url(&self, host: &str) -> String {
        format!("{}://{}/api/v4/version", self.config.protocol.scheme_for(host), host)
    }

    /// The generic package endpoint. Each part is encoded as a single path
    /// segment, so `group/project` becomes `group%2Fproject`.
    fn to_generic_package_url(&self, host: &str, package: &GenericPackage) -> Result<String> {
        let base = format!("{}://{}/", self.config.protocol.scheme_for(host), host);
        let mut url = Url::parse(&base)
            .map_err(|e| RegistryError::Configuration(format!("invalid host {:?}: {}", host, e)))?;
        url.path_segments_mut()
            .map_err(|_| RegistryError::Configuration(format!("invalid host {:?}", host)))?
            .pop_if_empty()
            .extend(&[
                "api",
                "v4",
                "projects",
                package.project.as_str(),
                "packages",
                "generic",
                package.name.as_str(),
                package.version.as_str(),
                package.file_name.as_str(),
            ]);
        Ok(url.to_string())
    }
}

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

/// A client configuration
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// A list of extra root certificate to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,

    /// `User-Agent` header sent with every request
    pub user_agent: Option<String>,
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    Https,
    #[allow(missing_docs)]
    HttpsExcept(Vec<String>),
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

/// Extract `Docker-Content-Digest` header from a manifest response.
/// Falls back to hashing the body when the header is absent.
fn digest_header_value(headers: &HeaderMap, body: &[u8]) -> Result<String> {
    match headers.get("Docker-Content-Digest") {
        None => {
            let hex = sha256_digest(body);
            debug!(%hex, "Computed digest of manifest payload.");
            Ok(hex)
        }
        Some(hv) => hv
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| RegistryError::Content(format!("invalid digest header: {}", e))),
    }
}

/// Computes the SHA256 digest of a byte slice
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}
