//! glreg: GitLab container registry downloads and generic package uploads.
//!
//! The registry protocol and token negotiation live in the `registry-client`
//! crate; this crate wires them to the command line.

pub mod config;
pub mod download;
pub mod extract;
pub mod upload;

use config::{Command, Opts};
use registry_client::client::{Client, GenericPackage};

/// Runs the command selected in `opts`.
pub async fn run(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Download(o) => {
            let client = Client::try_from(o.transport.client_config()?)?;
            let image = o.reference()?;
            download::download_image(
                &client,
                o.auth.credential(),
                &o.auth.session_options(),
                &image,
                &o.output_dir,
                &o.platform,
            )
            .await?;
        }
        Command::Extract(o) => {
            let source = match (o.archive, o.image_dir) {
                (Some(archive), _) => extract::Source::Archive(archive),
                (None, Some(dir)) => extract::Source::ImageDir(dir),
                (None, None) => anyhow::bail!("one of --archive or --image-dir is required"),
            };
            let (path, output) = (o.path, o.output);
            tokio::task::spawn_blocking(move || extract::extract_file(&source, &path, &output))
                .await??;
        }
        Command::Upload(o) => {
            let client = Client::try_from(o.transport.client_config()?)?;
            let package = GenericPackage {
                project: o.project.clone(),
                name: o.name.clone(),
                version: o.version.clone(),
                file_name: o.package_file_name()?,
            };
            upload::upload_file(
                &client,
                o.auth.credential(),
                &o.auth.session_options(),
                o.scope.as_deref(),
                &o.gitlab,
                &package,
                &o.file,
            )
            .await?;
        }
    }
    Ok(())
}
