//! Shared fixtures for unit tests: hand-built ustar archives, gzip, a mock
//! release host and a restarter that only records calls.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use crate::archive::ustar::BLOCK_SIZE;
use crate::config::{SourceConfig, UpdateConfig};
use crate::host::Restarter;
use crate::layout::InstallLayout;

pub const FIXTURE_MTIME: u64 = 1_700_000_000;

/// Build a single ustar header block with a valid checksum.
pub fn tar_header(name: &str, size: usize, typeflag: u8) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];
    let name = name.as_bytes();
    let len = name.len().min(100);
    header[..len].copy_from_slice(&name[..len]);

    write_octal(&mut header[100..108], 0o644);
    write_octal(&mut header[108..116], 0);
    write_octal(&mut header[116..124], 0);
    write_octal(&mut header[124..136], size as u64);
    write_octal(&mut header[136..148], FIXTURE_MTIME);
    header[156] = typeflag;
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    header[148..156].fill(b' ');
    let sum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    header[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
    header
}

fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let text = format!("{:0width$o}", value, width = width);
    field[..width].copy_from_slice(text.as_bytes());
    field[width] = 0;
}

#[derive(Default)]
pub struct TarBuilder {
    buf: Vec<u8>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: &str, typeflag: u8, data: &[u8]) -> Self {
        self.buf.extend_from_slice(&tar_header(name, data.len(), typeflag));
        self.buf.extend_from_slice(data);
        let padding = (BLOCK_SIZE - data.len() % BLOCK_SIZE) % BLOCK_SIZE;
        self.buf.extend(std::iter::repeat(0u8).take(padding));
        self
    }

    pub fn file(self, name: &str, data: &[u8]) -> Self {
        self.entry(name, b'0', data)
    }

    pub fn dir(self, name: &str) -> Self {
        self.entry(name, b'5', b"")
    }

    /// pax extended header carrying a `path=` record for the next entry
    pub fn pax_path(self, path: &str) -> Self {
        let body = format!("path={}\n", path);
        let base = body.len() + 1;
        let mut total = base + base.to_string().len();
        if total.to_string().len() != base.to_string().len() {
            total = base + total.to_string().len();
        }
        let record = format!("{} {}", total, body);
        self.entry("PaxHeaders/entry", b'x', record.as_bytes())
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&[0u8; BLOCK_SIZE * 2]);
        self.buf
    }
}

pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = async_compression::tokio::write::GzipEncoder::new(Vec::new());
    encoder.write_all(data).await.unwrap();
    encoder.shutdown().await.unwrap();
    encoder.into_inner()
}

/// A gzip'd release tarball laid out like a GitHub source archive
pub async fn release_archive(version: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let root = format!("hello-{}", version);
    let mut builder = TarBuilder::new()
        .dir(&format!("{}/", root))
        .file(&format!("{}/README.md", root), b"# hello")
        .dir(&format!("{}/app/", root));
    for (path, data) in files {
        builder = builder.file(&format!("{}/app/{}", root, path), data);
    }
    gzip(&builder.finish()).await
}

#[derive(Clone)]
struct MockState {
    tag: String,
    archive: Bytes,
    base_url: String,
    requests: Arc<AtomicUsize>,
}

/// In-process release host on `127.0.0.1:0` serving repository `acme/hello`
pub struct MockReleaseServer {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockReleaseServer {
    pub async fn start(tag: &str, archive: Vec<u8>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));

        let state = MockState {
            tag: tag.to_string(),
            archive: Bytes::from(archive),
            base_url: base_url.clone(),
            requests: requests.clone(),
        };

        let app = Router::new()
            .route("/repos/acme/hello/releases/latest", get(latest_release))
            .route("/acme/hello/main/app/VERSION", get(raw_version))
            .route("/dl/hello-app.tar.gz", get(redirect_to_archive))
            .route("/files/hello-app.tar.gz", get(serve_archive))
            .route("/acme/hello/archive/refs/heads/main.tar.gz", get(serve_archive))
            .route("/loop", get(redirect_loop))
            .with_state(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for MockReleaseServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn latest_release(State(state): State<MockState>) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "tag_name": state.tag,
        "published_at": "2026-01-01T00:00:00Z",
        "assets": [
            {
                "name": "checksums.txt",
                "browser_download_url": format!("{}/files/checksums.txt", state.base_url),
            },
            {
                "name": "hello-app.tar.gz",
                "browser_download_url": format!("{}/dl/hello-app.tar.gz", state.base_url),
            }
        ]
    }))
}

async fn raw_version(State(state): State<MockState>) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    format!("{}\n", state.tag.trim_start_matches('v'))
}

async fn redirect_to_archive(State(state): State<MockState>) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FOUND, [(header::LOCATION, "/files/hello-app.tar.gz")])
}

async fn serve_archive(State(state): State<MockState>) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    state.archive.clone()
}

async fn redirect_loop(State(state): State<MockState>) -> impl IntoResponse {
    state.requests.fetch_add(1, Ordering::SeqCst);
    (StatusCode::FOUND, [(header::LOCATION, "/loop")])
}

/// Restarter that records reasons instead of touching the host
#[derive(Default)]
pub struct RecordingRestarter {
    calls: Mutex<Vec<String>>,
}

impl RecordingRestarter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Restarter for RecordingRestarter {
    fn restart(&self, reason: &str) {
        self.calls.lock().unwrap().push(reason.to_string());
    }
}

/// Update configuration pointing every endpoint at `server`
pub fn update_config(server: &MockReleaseServer) -> UpdateConfig {
    UpdateConfig {
        source: SourceConfig {
            repository: "acme/hello".to_string(),
            api_base: server.base_url.clone(),
            raw_base: server.base_url.clone(),
            archive_base: server.base_url.clone(),
            ..SourceConfig::default()
        },
        auto_check: false,
        updateable_dirs: BTreeSet::from(["static".to_string()]),
        check_timeout_secs: 5,
        download_timeout_secs: 5,
        ..UpdateConfig::default()
    }
}

/// Populate `<root>/app/` with `files` and return the layout
pub async fn install_app(root: &Path, files: &[(&str, &[u8])]) -> InstallLayout {
    let layout = InstallLayout::new(root);
    for (path, data) in files {
        let target = layout.app_dir.join(path);
        tokio::fs::create_dir_all(target.parent().unwrap()).await.unwrap();
        tokio::fs::write(&target, data).await.unwrap();
    }
    layout
}
