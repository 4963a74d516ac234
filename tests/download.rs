//! Downloading an image from a mock registry, then extracting from it.

use flate2::write::GzEncoder;
use flate2::Compression;
use glreg::download::download_image;
use glreg::extract::{extract_file_in, Source};
use registry_client::client::{ClientConfig, ClientProtocol};
use registry_client::manifest::Platform;
use registry_client::session::SessionOptions;
use registry_client::{Client, Reference, RegistryError};
use serde_json::json;
use std::io::Write;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LIST_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("append entry");
    }
    builder.into_inner().expect("finish tar")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("compress");
    encoder.finish().expect("finish gzip")
}

fn http_client() -> Client {
    Client::new(ClientConfig {
        protocol: ClientProtocol::Http,
        ..Default::default()
    })
}

fn image(server: &MockServer) -> Reference {
    Reference::new(&server.address().to_string(), "g/p/i", Some("latest"))
        .expect("valid reference")
}

async fn mount_open_registry(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn mount_blob(server: &MockServer, digest: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/g/p/i/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(server)
        .await;
}

fn image_manifest() -> serde_json::Value {
    json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_TYPE,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 2,
            "digest": "sha256:c0c0"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 1,
                "digest": "sha256:aaaa"
            },
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "size": 1,
                "digest": "sha256:bbbb"
            }
        ]
    })
}

#[tokio::test]
async fn multi_platform_image_falls_back_to_first_entry() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;

    let list = json!({
        "schemaVersion": 2,
        "mediaType": LIST_TYPE,
        "manifests": [
            {
                "mediaType": MANIFEST_TYPE,
                "size": 10,
                "digest": "sha256:1111",
                "platform": {"architecture": "arm64", "os": "linux"}
            },
            {
                "mediaType": MANIFEST_TYPE,
                "size": 10,
                "digest": "sha256:2222",
                "platform": {"architecture": "amd64", "os": "windows"}
            }
        ]
    });
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", LIST_TYPE)
                .insert_header("Docker-Content-Digest", "sha256:0000")
                .set_body_string(list.to_string()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/sha256:1111"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", MANIFEST_TYPE)
                .set_body_string(image_manifest().to_string()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let bottom = gzip(&tar_with(&[
        ("etc/os-release", &b"bottom"[..]),
        ("bin/tool", &b"#!/bin/sh\n"[..]),
    ]));
    let top = tar_with(&[("etc/os-release", &b"top"[..])]);
    mount_blob(&server, "sha256:c0c0", b"{}".to_vec()).await;
    mount_blob(&server, "sha256:aaaa", bottom).await;
    mount_blob(&server, "sha256:bbbb", top).await;

    let out = tempfile::tempdir().expect("tempdir");
    let downloaded = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        out.path(),
        &Platform::default(),
    )
    .await
    .expect("download");

    assert_eq!(downloaded.manifest_digest, "sha256:1111");
    assert!(out.path().join("manifest_list.json").is_file());
    assert!(out.path().join("1111_manifest.json").is_file());
    assert!(!out.path().join("image_manifest.json").exists());
    assert_eq!(
        std::fs::read(out.path().join("c0c0.json")).expect("config"),
        b"{}"
    );
    assert_eq!(
        downloaded.layers,
        vec![
            out.path().join("layers/aaaa.tar.gz"),
            out.path().join("layers/bbbb.tar"),
        ]
    );

    let scratch = tempfile::tempdir().expect("scratch");
    let source = Source::ImageDir(out.path().to_path_buf());

    let release = out.path().join("extracted/os-release");
    let from = extract_file_in(&source, "/etc/os-release", &release, scratch.path())
        .expect("extract from top layer");
    assert_eq!(from, out.path().join("layers/bbbb.tar"));
    assert_eq!(std::fs::read(&release).expect("read"), b"top");

    let tool = out.path().join("tool");
    let from = extract_file_in(&source, "./bin/tool", &tool, scratch.path())
        .expect("extract from bottom layer");
    assert_eq!(from, out.path().join("layers/aaaa.tar.gz"));
    assert_eq!(std::fs::read(&tool).expect("read"), b"#!/bin/sh\n");
}

#[tokio::test]
async fn single_platform_image_uses_negotiated_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!(r#"Bearer realm="{}/jwt/auth""#, server.uri()).as_str(),
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jwt/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"access_token":"t0k"}"#))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .and(header("Authorization", "Bearer t0k"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(image_manifest().to_string()),
        )
        .expect(1)
        .mount(&server)
        .await;
    for digest in &["sha256:c0c0", "sha256:aaaa", "sha256:bbbb"] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/g/p/i/blobs/{}", digest)))
            .and(header("Authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let out = tempfile::tempdir().expect("tempdir");
    let downloaded = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        out.path(),
        &Platform::default(),
    )
    .await
    .expect("download");

    assert_eq!(downloaded.manifest_path, out.path().join("image_manifest.json"));
    assert!(!out.path().join("manifest_list.json").exists());
    assert!(out.path().join("layers/aaaa.tar.gz").is_file());
    assert!(out.path().join("layers/bbbb.tar").is_file());
}

#[tokio::test]
async fn manifest_without_config_is_a_content_error() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_TYPE,
        "layers": []
    });
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest.to_string()))
        .mount(&server)
        .await;

    let out = tempfile::tempdir().expect("tempdir");
    let err = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        out.path(),
        &Platform::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::Content(_))
    ));
    assert!(out.path().join("image_manifest.json").is_file());
}

#[tokio::test]
async fn missing_manifest_reports_status() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#,
        ))
        .mount(&server)
        .await;

    let out = tempfile::tempdir().expect("tempdir");
    let err = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        out.path(),
        &Platform::default(),
    )
    .await
    .unwrap_err();

    let registry_err = err
        .downcast_ref::<RegistryError>()
        .expect("registry error");
    assert_eq!(registry_err.status(), Some(reqwest::StatusCode::NOT_FOUND));
    assert!(format!("{:?}", err).contains("manifest unknown"));
}

#[tokio::test]
async fn digests_that_are_not_hex_never_reach_the_file_system() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;
    let mut manifest = image_manifest();
    manifest["layers"][1]["digest"] = json!("sha256:../../escaped");
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(manifest.to_string()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/v2/g/p/i/blobs/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let root = tempfile::tempdir().expect("tempdir");
    let out = root.path().join("out");
    let err = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        &out,
        &Platform::default(),
    )
    .await
    .unwrap_err();

    match err.downcast_ref::<RegistryError>() {
        Some(RegistryError::Content(msg)) => assert!(msg.contains("escaped"), "{}", msg),
        other => panic!("expected a content error, got {:?}", other),
    }
    assert!(!root.path().join("escaped.tar").exists());
    let entries: Vec<_> = std::fs::read_dir(root.path())
        .expect("read root")
        .map(|e| e.expect("entry").file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("out")]);
    assert_eq!(
        std::fs::read_dir(out.join("layers")).expect("layers").count(),
        0
    );
}

#[tokio::test]
async fn manifest_list_entry_digest_is_checked() {
    let server = MockServer::start().await;
    mount_open_registry(&server).await;
    let list = json!({
        "schemaVersion": 2,
        "mediaType": LIST_TYPE,
        "manifests": [{
            "mediaType": MANIFEST_TYPE,
            "size": 10,
            "digest": "sha256:../../../list",
            "platform": {"architecture": "amd64", "os": "linux"}
        }]
    });
    Mock::given(method("GET"))
        .and(path("/v2/g/p/i/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(list.to_string()))
        .mount(&server)
        .await;

    let out = tempfile::tempdir().expect("tempdir");
    let err = download_image(
        &http_client(),
        None,
        &SessionOptions::default(),
        &image(&server),
        out.path(),
        &Platform::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::Content(_))
    ));
    assert_eq!(server.received_requests().await.map(|r| r.len()), Some(2));
}
