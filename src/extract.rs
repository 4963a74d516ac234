//! Pulling a single file out of a layer archive or a downloaded image.

use crate::download::{layer_path, IMAGE_MANIFEST_FILE, PLATFORM_MANIFEST_SUFFIX};
use anyhow::Context;
use flate2::read::GzDecoder;
use registry_client::manifest::{parse_manifest, ManifestKind, OciManifest};
use registry_client::RegistryError;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Where to look for the file.
#[derive(Debug, Clone)]
pub enum Source {
    /// A single layer archive, plain or gzip compressed
    Archive(PathBuf),
    /// An output directory of `glreg download`
    ImageDir(PathBuf),
}

/// Extracts `inner_path` from `source` to `output`, staging it in the system
/// temp directory. Returns the archive the file came from.
pub fn extract_file(source: &Source, inner_path: &str, output: &Path) -> anyhow::Result<PathBuf> {
    extract_file_in(source, inner_path, output, &std::env::temp_dir())
}

/// Like [`extract_file`] but stages under `scratch`.
pub fn extract_file_in(
    source: &Source,
    inner_path: &str,
    output: &Path,
    scratch: &Path,
) -> anyhow::Result<PathBuf> {
    let wanted = normalize(Path::new(inner_path));
    if wanted.as_os_str().is_empty() {
        anyhow::bail!("{:?} does not name a file", inner_path);
    }

    let archives = match source {
        Source::Archive(path) => vec![path.clone()],
        Source::ImageDir(dir) => {
            let manifest = read_saved_manifest(dir)?;
            manifest
                .layers
                .iter()
                .rev()
                .map(|l| layer_path(dir, &l.digest, &l.media_type))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    for archive in archives {
        if !archive.exists() {
            return Err(RegistryError::Content(format!(
                "layer {} has not been downloaded",
                archive.display()
            ))
            .into());
        }
        if extract_from_archive(&archive, &wanted, output, scratch)? {
            info!(
                path = %wanted.display(),
                archive = %archive.display(),
                output = %output.display(),
                "Extracted file"
            );
            return Ok(archive);
        }
        debug!(archive = %archive.display(), "File not in layer");
    }

    Err(RegistryError::Content(format!("file {} not found in archive", wanted.display())).into())
}

/// Looks for `wanted` in one archive. Returns `false` if it is not there.
fn extract_from_archive(
    archive: &Path,
    wanted: &Path,
    output: &Path,
    scratch: &Path,
) -> anyhow::Result<bool> {
    let staging = tempfile::Builder::new()
        .prefix("glreg-extract")
        .tempdir_in(scratch)
        .context("creating temporary directory")?;

    let mut tar = tar::Archive::new(open_layer(archive)?);
    let entries = tar
        .entries()
        .with_context(|| format!("reading {}", archive.display()))?;
    for entry in entries {
        let mut entry = entry.with_context(|| format!("reading {}", archive.display()))?;
        if normalize(&entry.path()?) != wanted {
            continue;
        }
        let kind = entry.header().entry_type();
        if !kind.is_file() {
            return Err(RegistryError::Content(format!(
                "{} in {} is not a regular file ({:?})",
                wanted.display(),
                archive.display(),
                kind
            ))
            .into());
        }

        let staged = staging.path().join("entry");
        entry
            .unpack(&staged)
            .with_context(|| format!("unpacking {}", wanted.display()))?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::copy(&staged, output).with_context(|| format!("writing {}", output.display()))?;
        return Ok(true);
    }
    Ok(false)
}

/// Opens a layer, decompressing it when it starts with the gzip magic.
fn open_layer(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    if reader.fill_buf()?.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Drops `.`, leading `/` and other non-name components.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

fn read_saved_manifest(dir: &Path) -> anyhow::Result<OciManifest> {
    let path = find_saved_manifest(dir)?;
    let body = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    match parse_manifest(&body, None)? {
        ManifestKind::Image(m) => Ok(m),
        ManifestKind::List(_) => Err(RegistryError::Content(format!(
            "{} is a manifest list, not an image manifest",
            path.display()
        ))
        .into()),
    }
}

fn find_saved_manifest(dir: &Path) -> anyhow::Result<PathBuf> {
    let single = dir.join(IMAGE_MANIFEST_FILE);
    if single.is_file() {
        return Ok(single);
    }
    let listing = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    let mut found = Vec::new();
    for entry in listing {
        let path = entry?.path();
        let is_platform_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(PLATFORM_MANIFEST_SUFFIX));
        if is_platform_manifest && path.is_file() {
            found.push(path);
        }
    }
    match found.len() {
        0 => Err(RegistryError::Content(format!("no image manifest in {}", dir.display())).into()),
        1 => Ok(found.remove(0)),
        _ => {
            found.sort();
            Err(RegistryError::Content(format!(
                "{} holds several platform manifests ({}); extract from a layer with --archive",
                dir.display(),
                found
                    .iter()
                    .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .into())
        }
    }
}
