//! Image manifests, manifest lists and platform selection
use crate::errors::{RegistryError, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// The mediatype for a Docker v2 image manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// The mediatype for a Docker v2 manifest list.
pub const IMAGE_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// The mediatype for an OCI image manifest.
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype that Docker uses for image configs.
pub const IMAGE_DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// The mediatype for a layer.
pub const IMAGE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype for a layer that is gzipped.
pub const IMAGE_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// The mediatype that Docker uses for a layer that is gzipped.
pub const IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// The mediatype that Docker uses for an uncompressed layer.
pub const IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// The mediatype for a layer that is nondistributable.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
/// The mediatype for a layer that is nondistributable and gzipped.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Everything a manifest request is willing to take.
pub const MIME_TYPES_DISTRIBUTION_MANIFEST: &[&str] = &[
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
];

/// The image manifest describes one image for one platform.
///
/// Docker v2 and OCI manifests share this layout:
/// https://github.com/opencontainers/image-spec/blob/master/manifest.md
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    /// This is a schema version. The only version allowed is `2`.
    pub schema_version: u8,

    /// This is an optional media type describing this manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image configuration.
    ///
    /// Optional at the serde level so a missing config surfaces as a
    /// content error instead of a parse error.
    pub config: Option<OciDescriptor>,

    /// The image layers, base layer first.
    #[serde(default)]
    pub layers: Vec<OciDescriptor>,

    /// The annotations for this manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciManifest {
    /// The config descriptor, or a content error when the manifest has none.
    pub fn config_descriptor(&self) -> Result<&OciDescriptor> {
        match &self.config {
            Some(c) if !c.digest.is_empty() => Ok(c),
            _ => Err(RegistryError::Content(
                "manifest does not name a config digest".to_owned(),
            )),
        }
    }
}

/// A manifest list (Docker) or image index (OCI).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciImageIndex {
    /// Always `2`
    pub schema_version: u8,
    /// Media type of the list, if declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// One entry per platform
    #[serde(default)]
    pub manifests: Vec<ImageIndexEntry>,
}

/// An entry of a manifest list
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndexEntry {
    /// Media type of the referenced manifest
    pub media_type: String,
    /// Digest of the referenced manifest
    pub digest: String,
    /// Size of the referenced manifest
    pub size: i64,
    /// The platform the referenced manifest targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// The operating system and architecture an image runs on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Platform {
    /// CPU architecture, Go style (`amd64`, `arm64`, ...)
    pub architecture: String,
    /// Operating system, Go style (`linux`, `windows`, ...)
    pub os: String,
    /// CPU variant (`v8`, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Creates a platform without variant.
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            architecture: architecture.to_owned(),
            os: os.to_owned(),
            variant: None,
        }
    }

    fn matches(&self, other: &Platform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && (self.variant.is_none() || self.variant == other.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::new("linux", "amd64")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    /// Parses `os/arch[/variant]`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform::new(os, arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Platform {
                    variant: Some((*variant).to_owned()),
                    ..Platform::new(os, arch)
                })
            }
            _ => Err(format!("platform {:?} is not of the form os/arch[/variant]", s)),
        }
    }
}

/// Versioned provides a struct with the manifest's schemaVersion and mediaType.
/// Incoming content with unknown schema versions can be decoded against this
/// struct to check the version.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// schema_version is the image manifest schema that this image follows
    pub schema_version: i32,

    /// media_type is the media type of this schema.
    pub media_type: Option<String>,
}

/// The OCI descriptor is a generic object used to describe other objects.
///
/// It is defined in the OCI Image Specification:
/// https://github.com/opencontainers/image-spec/blob/master/descriptor.md#properties
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// The media type of this descriptor.
    pub media_type: String,
    /// The digest of the object this describes.
    #[serde(default)]
    pub digest: String,
    /// The size, in bytes, of the object this describes.
    #[serde(default)]
    pub size: i64,
    /// This OPTIONAL property specifies a list of URIs from which this
    /// object MAY be downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// This OPTIONAL property contains arbitrary metadata for this descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// How a layer blob is stored on disk, judged by its media type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerFormat {
    /// An uncompressed tar archive
    Tar,
    /// A gzip compressed tar archive
    TarGzip,
    /// Anything else
    Blob,
}

impl LayerFormat {
    /// Classifies a layer media type.
    pub fn from_media_type(media_type: &str) -> Self {
        match media_type {
            IMAGE_LAYER_MEDIA_TYPE
            | IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE
            | IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE => LayerFormat::Tar,
            IMAGE_LAYER_GZIP_MEDIA_TYPE
            | IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE
            | IMAGE_LAYER_NONDISTRIBUTABLE_GZIP_MEDIA_TYPE => LayerFormat::TarGzip,
            _ => LayerFormat::Blob,
        }
    }

    /// File extension used for downloaded layers.
    pub fn extension(&self) -> &'static str {
        match self {
            LayerFormat::Tar => "tar",
            LayerFormat::TarGzip => "tar.gz",
            LayerFormat::Blob => "blob",
        }
    }
}

/// A fetched manifest body, classified.
#[derive(Debug, Clone)]
pub enum ManifestKind {
    /// A single-platform image manifest
    Image(OciManifest),
    /// A multi-platform manifest list or index
    List(OciImageIndex),
}

/// Classifies a manifest body.
///
/// `content_type` is the response's `Content-Type`; the body's own
/// `mediaType` wins when present. Bodies without any media type are taken to
/// be an index when they carry a `manifests` array.
pub fn parse_manifest(body: &[u8], content_type: Option<&str>) -> Result<ManifestKind> {
    let versioned: Versioned = serde_json::from_slice(body)
        .map_err(|e| RegistryError::Content(format!("manifest is not valid JSON: {}", e)))?;
    if versioned.schema_version != 2 {
        return Err(RegistryError::Content(format!(
            "unsupported schema version: {}",
            versioned.schema_version
        )));
    }

    let media_type = versioned.media_type.clone().or_else(|| {
        content_type
            .map(|c| c.split(';').next().unwrap_or(c).trim().to_owned())
            .filter(|c| c != "application/json" && !c.is_empty())
    });
    debug!(?media_type, "Classifying manifest");

    match media_type.as_deref() {
        Some(IMAGE_MANIFEST_LIST_MEDIA_TYPE) | Some(OCI_IMAGE_INDEX_MEDIA_TYPE) => {
            Ok(ManifestKind::List(serde_json::from_slice(body)?))
        }
        Some(IMAGE_MANIFEST_MEDIA_TYPE) | Some(OCI_IMAGE_MEDIA_TYPE) => {
            Ok(ManifestKind::Image(serde_json::from_slice(body)?))
        }
        Some(other) => Err(RegistryError::Content(format!(
            "unsupported manifest media type: {}",
            other
        ))),
        None => {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            if value.get("manifests").map_or(false, |m| m.is_array()) {
                Ok(ManifestKind::List(serde_json::from_value(value)?))
            } else {
                Ok(ManifestKind::Image(serde_json::from_value(value)?))
            }
        }
    }
}

/// The entry picked from a manifest list.
#[derive(Debug, Clone)]
pub struct PlatformSelection<'a> {
    /// The chosen entry
    pub entry: &'a ImageIndexEntry,
    /// `false` when no entry matched and the first one was taken
    pub matched: bool,
}

/// Picks the manifest for `platform` from a manifest list.
///
/// When nothing matches, the first entry is used and a warning is logged.
/// Only an empty list is an error.
pub fn select_platform<'a>(
    index: &'a OciImageIndex,
    platform: &Platform,
) -> Result<PlatformSelection<'a>> {
    if let Some(entry) = index
        .manifests
        .iter()
        .find(|e| e.platform.as_ref().map_or(false, |p| platform.matches(p)))
    {
        debug!(digest = %entry.digest, %platform, "Selected manifest entry");
        return Ok(PlatformSelection {
            entry,
            matched: true,
        });
    }

    let entry = index
        .manifests
        .first()
        .ok_or_else(|| RegistryError::Content("manifest list has no entries".to_owned()))?;
    warn!(
        %platform,
        digest = %entry.digest,
        available = ?index.manifests.iter().filter_map(|e| e.platform.as_ref().map(|p| p.to_string())).collect::<Vec<_>>(),
        "No manifest for the requested platform; falling back to the first entry"
    );
    Ok(PlatformSelection {
        entry,
        matched: false,
    })
}
