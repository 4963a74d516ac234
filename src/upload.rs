//! Uploading a file as a GitLab generic package.

use anyhow::Context;
use registry_client::client::{sha256_digest, Client, GenericPackage};
use registry_client::secrets::LongLivedCredential;
use registry_client::session::SessionOptions;
use reqwest::StatusCode;
use std::path::Path;
use tracing::info;

/// Uploads `file` to `host` as `package`.
pub async fn upload_file(
    client: &Client,
    credential: Option<LongLivedCredential>,
    options: &SessionOptions,
    scope: Option<&str>,
    host: &str,
    package: &GenericPackage,
    file: &Path,
) -> anyhow::Result<StatusCode> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let digest = sha256_digest(&data);

    let mut session = client
        .package_session(host, credential, scope, options)
        .await;
    let res = client
        .push_generic_package(&mut session, host, package, data)
        .await
        .with_context(|| {
            format!(
                "uploading {} to {}/{}/{}",
                file.display(),
                package.project,
                package.name,
                package.version
            )
        })?;

    match res.status {
        StatusCode::OK | StatusCode::CREATED => {
            info!(
                status = res.status.as_u16(),
                %digest,
                project = %package.project,
                package = %package.name,
                version = %package.version,
                file = %package.file_name,
                "Package file uploaded"
            );
            Ok(res.status)
        }
        other => anyhow::bail!(
            "unexpected status {} from the package API for {}",
            other,
            package.file_name
        ),
    }
}
