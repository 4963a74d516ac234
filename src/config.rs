//! Command line configuration
//!
//! Every flag that names a secret or a CI coordinate can also come from the
//! environment, so the tool drops into a GitLab CI job without arguments.

use anyhow::Context;
use registry_client::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use registry_client::manifest::Platform;
use registry_client::secrets::LongLivedCredential;
use registry_client::session::SessionOptions;
use registry_client::Reference;
use std::path::PathBuf;
use structopt::StructOpt;

/// Top level options
#[derive(StructOpt, Debug)]
#[structopt(
    name = "glreg",
    about = "Download images from, and upload generic packages to, a GitLab instance"
)]
pub struct Opts {
    #[structopt(
        short = "v",
        long = "verbose",
        parse(from_occurrences),
        global = true,
        help = "More log output (-v debug, -vv trace). RUST_LOG takes precedence"
    )]
    pub verbose: u8,

    #[structopt(subcommand)]
    pub command: Command,
}

/// The three operations
#[derive(StructOpt, Debug)]
pub enum Command {
    /// Download an image's manifest, config and layers
    #[structopt(name = "download")]
    Download(DownloadOpts),
    /// Extract one file from a downloaded layer or image directory
    #[structopt(name = "extract")]
    Extract(ExtractOpts),
    /// Upload a file as a generic package
    #[structopt(name = "upload")]
    Upload(UploadOpts),
}

/// Credentials and token negotiation overrides
#[derive(StructOpt, Debug, Clone)]
pub struct AuthOpts {
    #[structopt(
        long = "token",
        env = "GLREG_TOKEN",
        hide_env_values = true,
        help = "Personal, deploy or job token. Omit for anonymous access"
    )]
    pub token: Option<String>,

    #[structopt(
        long = "username",
        env = "GLREG_USERNAME",
        help = "Send the token with HTTP Basic auth under this username"
    )]
    pub username: Option<String>,

    #[structopt(
        long = "realm",
        env = "GLREG_REALM",
        help = "Token endpoint to use instead of discovering it"
    )]
    pub realm: Option<String>,

    #[structopt(
        long = "service",
        env = "GLREG_SERVICE",
        help = "Service to request tokens for when the challenge omits it [default: container_registry]"
    )]
    pub service: Option<String>,

    #[structopt(
        long = "no-token-exchange",
        help = "Send the token directly and never ask for a bearer token"
    )]
    pub no_token_exchange: bool,
}

impl AuthOpts {
    /// The operator's credential, if a token was given.
    pub fn credential(&self) -> Option<LongLivedCredential> {
        self.token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| LongLivedCredential::new(t.clone(), self.username.clone()))
    }

    /// Overrides for the auth bootstrap.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            realm: self.realm.clone(),
            service: self.service.clone(),
            direct_only: self.no_token_exchange,
        }
    }
}

/// Connection settings
#[derive(StructOpt, Debug, Clone)]
pub struct TransportOpts {
    #[structopt(
        long = "insecure-registry",
        env = "GLREG_INSECURE_REGISTRIES",
        use_delimiter = true,
        help = "Hosts to reach over plain HTTP. Can be repeated or comma separated"
    )]
    pub insecure_registries: Vec<String>,

    #[structopt(
        long = "insecure-skip-tls-verify",
        help = "Accept invalid TLS certificates"
    )]
    pub insecure_skip_tls_verify: bool,

    #[structopt(
        long = "ca-cert",
        env = "GLREG_CA_CERT",
        parse(from_os_str),
        help = "Extra PEM root certificate to trust"
    )]
    pub ca_cert: Option<PathBuf>,
}

impl TransportOpts {
    /// Builds the client configuration, reading the CA certificate if given.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let extra_root_certificates = match &self.ca_cert {
            Some(path) => vec![Certificate {
                encoding: CertificateEncoding::Pem,
                data: std::fs::read(path)
                    .with_context(|| format!("reading CA certificate {}", path.display()))?,
            }],
            None => Vec::new(),
        };
        let protocol = if self.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(self.insecure_registries.clone())
        };
        Ok(ClientConfig {
            protocol,
            accept_invalid_certificates: self.insecure_skip_tls_verify,
            extra_root_certificates,
            user_agent: Some(concat!("glreg/", env!("CARGO_PKG_VERSION")).to_owned()),
        })
    }
}

/// Options of `glreg download`
#[derive(StructOpt, Debug)]
pub struct DownloadOpts {
    #[structopt(
        long = "registry",
        env = "GLREG_REGISTRY",
        help = "Registry host, e.g. registry.gitlab.com"
    )]
    pub registry: String,

    #[structopt(
        long = "image",
        help = "Image path inside the registry, e.g. group/project/image"
    )]
    pub image: String,

    #[structopt(long = "tag", help = "Tag to download [default: latest]")]
    pub tag: Option<String>,

    #[structopt(
        long = "digest",
        conflicts_with = "tag",
        help = "Manifest digest to download instead of a tag"
    )]
    pub digest: Option<String>,

    #[structopt(
        short = "o",
        long = "output-dir",
        parse(from_os_str),
        help = "Directory to write the manifest, config and layers to"
    )]
    pub output_dir: PathBuf,

    #[structopt(
        long = "platform",
        default_value = "linux/amd64",
        env = "GLREG_PLATFORM",
        help = "Platform to pick from a multi-platform image (os/arch[/variant])"
    )]
    pub platform: Platform,

    #[structopt(flatten)]
    pub auth: AuthOpts,

    #[structopt(flatten)]
    pub transport: TransportOpts,
}

impl DownloadOpts {
    /// The image to download.
    pub fn reference(&self) -> anyhow::Result<Reference> {
        let selector = match (&self.digest, &self.tag) {
            (Some(d), _) => {
                if !d.contains(':') {
                    anyhow::bail!("digest {:?} must look like sha256:<hex>", d);
                }
                Some(d.as_str())
            }
            (None, Some(t)) => {
                if t.contains(':') {
                    anyhow::bail!("tag {:?} must not contain ':'; use --digest", t);
                }
                Some(t.as_str())
            }
            (None, None) => None,
        };
        Reference::new(&self.registry, &self.image, selector)
            .with_context(|| format!("invalid image {}/{}", self.registry, self.image))
    }
}

/// Options of `glreg extract`
#[derive(StructOpt, Debug)]
pub struct ExtractOpts {
    #[structopt(
        long = "archive",
        parse(from_os_str),
        required_unless = "image-dir",
        conflicts_with = "image-dir",
        help = "Layer archive (.tar or .tar.gz) to read"
    )]
    pub archive: Option<PathBuf>,

    #[structopt(
        long = "image-dir",
        parse(from_os_str),
        help = "Directory written by `glreg download`; layers are searched top-down"
    )]
    pub image_dir: Option<PathBuf>,

    #[structopt(long = "path", help = "Path of the file inside the image")]
    pub path: String,

    #[structopt(
        short = "o",
        long = "output",
        parse(from_os_str),
        help = "Where to write the extracted file"
    )]
    pub output: PathBuf,
}

/// Options of `glreg upload`
#[derive(StructOpt, Debug)]
pub struct UploadOpts {
    #[structopt(
        long = "gitlab",
        env = "CI_SERVER_HOST",
        help = "GitLab host, e.g. gitlab.com"
    )]
    pub gitlab: String,

    #[structopt(
        long = "project",
        env = "CI_PROJECT_ID",
        help = "Project id or full path (group/project)"
    )]
    pub project: String,

    #[structopt(long = "name", help = "Package name")]
    pub name: String,

    #[structopt(long = "version", help = "Package version")]
    pub version: String,

    #[structopt(long = "file", parse(from_os_str), help = "File to upload")]
    pub file: PathBuf,

    #[structopt(
        long = "filename",
        help = "File name inside the package [default: the uploaded file's name]"
    )]
    pub filename: Option<String>,

    #[structopt(
        long = "scope",
        env = "GLREG_SCOPE",
        help = "Token scope to request when the API asks for token exchange [default: api]"
    )]
    pub scope: Option<String>,

    #[structopt(flatten)]
    pub auth: AuthOpts,

    #[structopt(flatten)]
    pub transport: TransportOpts,
}

impl UploadOpts {
    /// The file name used in the package URL.
    pub fn package_file_name(&self) -> anyhow::Result<String> {
        match &self.filename {
            Some(name) if !name.is_empty() => Ok(name.clone()),
            _ => self
                .file
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    anyhow::anyhow!("cannot derive a file name from {}", self.file.display())
                }),
        }
    }
}
