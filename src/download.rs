//! Downloading an image to a directory.
//!
//! Layout of the output directory:
//!
//! ```text
//! manifest_list.json            only for multi-platform images
//! <hex>_manifest.json           the selected platform's manifest (multi-platform)
//! image_manifest.json           the manifest (single-platform)
//! <config hex>.json             the image config
//! layers/<hex>.<tar|tar.gz|blob>
//! ```

use anyhow::Context;
use registry_client::client::Client;
use registry_client::manifest::{
    parse_manifest, select_platform, LayerFormat, ManifestKind, Platform,
};
use registry_client::secrets::LongLivedCredential;
use registry_client::session::SessionOptions;
use registry_client::{split_digest, Reference, RegistryError};
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the stored manifest list.
pub const MANIFEST_LIST_FILE: &str = "manifest_list.json";
/// Name of the stored manifest of a single-platform image.
pub const IMAGE_MANIFEST_FILE: &str = "image_manifest.json";
/// Suffix of a platform manifest picked from a list.
pub const PLATFORM_MANIFEST_SUFFIX: &str = "_manifest.json";
/// Subdirectory holding the layers.
pub const LAYERS_DIR: &str = "layers";

/// What ended up on disk.
#[derive(Debug)]
pub struct DownloadedImage {
    /// Digest of the image manifest that was followed
    pub manifest_digest: String,
    /// Where the image manifest was written
    pub manifest_path: PathBuf,
    /// Where the config blob was written
    pub config_path: PathBuf,
    /// Layers in manifest order (bottom first)
    pub layers: Vec<PathBuf>,
}

/// The file name stem for a digest: the hex part after the algorithm.
///
/// Digests come from the registry, so anything that is not `algorithm:hex`
/// is refused before it can become part of a path.
pub fn digest_file_stem(digest: &str) -> Result<&str, RegistryError> {
    split_digest(digest)
        .map(|(_, hex)| hex)
        .map_err(|_| RegistryError::Content(format!("invalid digest {:?}", digest)))
}

/// Path of a layer inside an output directory.
pub fn layer_path(
    output_dir: &Path,
    digest: &str,
    media_type: &str,
) -> Result<PathBuf, RegistryError> {
    Ok(output_dir.join(LAYERS_DIR).join(format!(
        "{}.{}",
        digest_file_stem(digest)?,
        LayerFormat::from_media_type(media_type).extension()
    )))
}

/// Downloads `image` for `platform` into `output_dir`.
pub async fn download_image(
    client: &Client,
    credential: Option<LongLivedCredential>,
    options: &SessionOptions,
    image: &Reference,
    output_dir: &Path,
    platform: &Platform,
) -> anyhow::Result<DownloadedImage> {
    tokio::fs::create_dir_all(output_dir.join(LAYERS_DIR))
        .await
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let mut session = client.registry_session(image, credential, options).await;
    info!(%image, mode = ?session.mode(), "Downloading image");

    let fetched = client
        .pull_manifest(&mut session, image)
        .await
        .with_context(|| format!("fetching manifest of {}", image))?;

    let (manifest, manifest_digest, manifest_path) =
        match parse_manifest(&fetched.body, fetched.content_type.as_deref())? {
            ManifestKind::Image(manifest) => {
                let path = output_dir.join(IMAGE_MANIFEST_FILE);
                write_file(&path, &fetched.body).await?;
                (manifest, fetched.digest, path)
            }
            ManifestKind::List(index) => {
                write_file(&output_dir.join(MANIFEST_LIST_FILE), &fetched.body).await?;
                let selection = select_platform(&index, platform)?;
                let path = output_dir.join(format!(
                    "{}{}",
                    digest_file_stem(&selection.entry.digest)?,
                    PLATFORM_MANIFEST_SUFFIX
                ));
                let child = image.with_digest(&selection.entry.digest);
                let fetched = client
                    .pull_manifest(&mut session, &child)
                    .await
                    .with_context(|| format!("fetching platform manifest {}", child))?;
                let manifest = match parse_manifest(&fetched.body, fetched.content_type.as_deref())? {
                    ManifestKind::Image(m) => m,
                    ManifestKind::List(_) => {
                        return Err(RegistryError::Content(format!(
                            "manifest list entry {} is itself a manifest list",
                            selection.entry.digest
                        ))
                        .into())
                    }
                };
                write_file(&path, &fetched.body).await?;
                (manifest, selection.entry.digest.clone(), path)
            }
        };

    let config = manifest.config_descriptor()?;
    let config_path = output_dir.join(format!("{}.json", digest_file_stem(&config.digest)?));
    let layer_paths = manifest
        .layers
        .iter()
        .map(|l| layer_path(output_dir, &l.digest, &l.media_type))
        .collect::<Result<Vec<_>, _>>()?;

    client
        .pull_blob_to_file(&mut session, image, &config.digest, &config_path)
        .await
        .with_context(|| format!("fetching config {}", config.digest))?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for (i, (layer, path)) in manifest.layers.iter().zip(layer_paths).enumerate() {
        let size = client
            .pull_blob_to_file(&mut session, image, &layer.digest, &path)
            .await
            .with_context(|| format!("fetching layer {}", layer.digest))?;
        info!(
            layer = i + 1,
            of = manifest.layers.len(),
            digest = %layer.digest,
            size,
            "Downloaded layer"
        );
        layers.push(path);
    }

    info!(
        digest = %manifest_digest,
        dir = %output_dir.display(),
        exchanges = session.exchanges(),
        "Image downloaded"
    );
    Ok(DownloadedImage {
        manifest_digest,
        manifest_path,
        config_path,
        layers,
    })
}

async fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use registry_client::manifest::{IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE};

    #[test]
    fn digest_stems() {
        assert_eq!(digest_file_stem("sha256:abc").unwrap(), "abc");
        assert!(digest_file_stem("abc").is_err());
        assert!(matches!(
            digest_file_stem("sha256:../../x"),
            Err(RegistryError::Content(_))
        ));
    }

    #[test]
    fn layer_paths_follow_media_type() {
        let dir = Path::new("out");
        assert_eq!(
            layer_path(dir, "sha256:aa", IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE).unwrap(),
            Path::new("out/layers/aa.tar.gz")
        );
        assert_eq!(
            layer_path(dir, "sha256:bb", IMAGE_LAYER_MEDIA_TYPE).unwrap(),
            Path::new("out/layers/bb.tar")
        );
        assert_eq!(
            layer_path(dir, "sha256:cc", "application/octet-stream").unwrap(),
            Path::new("out/layers/cc.blob")
        );
    }
}
