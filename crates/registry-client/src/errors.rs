//! Errors related to talking to a registry or the package API

use reqwest::StatusCode;

/// The error type returned by every fallible operation in this crate.
///
/// Discovery problems never show up here: they are logged and the session
/// degrades to using the long-lived credential directly.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    /// A mandatory setting is missing or malformed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The token endpoint could not produce a bearer token
    #[error("token exchange failed: {0}")]
    AuthExchange(String),

    /// No credential could be obtained before sending a request
    #[error("no credential available for {url}")]
    CredentialUnavailable {
        /// The request that needed the credential
        url: String,
        /// What went wrong while obtaining it
        #[source]
        source: Box<RegistryError>,
    },

    /// The server answered with a status that ends the request
    #[error("{method} {url} returned {status}: {message}")]
    HttpStatus {
        /// HTTP method of the failed request
        method: String,
        /// Target of the failed request
        url: String,
        /// Final status code
        status: StatusCode,
        /// The response body, or the first OCI error message found in it
        message: String,
    },

    /// The response was well formed HTTP but not the content we expected
    #[error("unexpected content: {0}")]
    Content(String),

    /// Transport level failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Local file system failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A JSON body could not be decoded
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// Returns the HTTP status when the error came from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RegistryError::HttpStatus { status, .. } => Some(*status),
            RegistryError::CredentialUnavailable { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Shorthand for results in this crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::error::Error for OciError {}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message.as_str())
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct OciEnvelope {
    pub(crate) errors: Vec<OciError>,
}

/// OCI error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    BlobUnknown,
    /// Blob upload is invalid
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ManifestInvalid,
    /// Manifest unknown
    ///
    /// This error is returned when the manifest, identified by name and tag is unknown to the repository.
    ManifestUnknown,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
    /// Any code this client does not know about
    #[serde(other)]
    Unknown,
}

/// Turns an error response body into something readable.
///
/// Registries answer with an OCI error envelope, the GitLab API with
/// `{"message": ...}` or plain text. Falls back to the raw body.
pub(crate) fn describe_error_body(body: &str) -> String {
    if let Ok(envelope) = serde_json::from_str::<OciEnvelope>(body) {
        if let Some(first) = envelope.errors.first() {
            return first.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "<empty body>".to_owned()
    } else {
        trimmed.to_owned()
    }
}
