//! Segmented (HLS) upload
//!
//! A playlist and its fragment directory are sent as a few large multipart
//! requests instead of one request per fragment. Fragments go in name order;
//! the playlist always travels with the last batch.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, FilePart};
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};
use crate::transfer::stats::TransferStats;
use crate::transfer::upload::check_pattern;
use crate::transfer::{report, ProgressCallback};

static REMOTE_DIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{10,50}$").expect("remote dir pattern is valid"));

const SEGMENTED_UPLOAD_URI: &str = "upload/hls/";

/// Options for [`MediaServerClient::hls_upload`]
#[derive(Debug, Clone)]
pub struct SegmentedUploadOptions {
    /// Existing remote directory to upload into
    pub remote_dir: Option<String>,
    pub timeout: Duration,
    pub max_retry: u32,
}

impl Default for SegmentedUploadOptions {
    fn default() -> Self {
        Self {
            remote_dir: None,
            timeout: Duration::from_secs(600),
            max_retry: 10,
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    files: Vec<(PathBuf, u64)>,
    bytes: u64,
}

impl Batch {
    fn push(&mut self, path: PathBuf, size: u64) {
        self.bytes += size;
        self.files.push((path, size));
    }

    fn is_full(&self, max_bytes: u64, max_files: usize) -> bool {
        self.bytes > max_bytes || self.files.len() >= max_files
    }
}

/// Directory holding the fragments of a playlist: its sibling named after the playlist stem
fn fragments_dir(playlist: &Path) -> Option<PathBuf> {
    let stem = playlist.file_stem()?;
    Some(playlist.with_file_name(stem))
}

impl MediaServerClient {
    /// Upload a playlist and its fragments, returning the remote directory name
    pub async fn hls_upload(
        &self,
        playlist: &Path,
        options: &SegmentedUploadOptions,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<String> {
        if !self.capabilities().await?.segmented_upload {
            return Err(ClientError::unsupported("The MediaServer version does not support HLS upload"));
        }
        if !playlist.is_file() {
            return Err(ClientError::validation_error_with_field(
                format!("The given m3u8 file \"{}\" does not exist", playlist.display()),
                "m3u8",
            ));
        }
        let dir = fragments_dir(playlist).filter(|d| d.is_dir()).ok_or_else(|| {
            ClientError::validation_error_with_field(
                format!("The fragments directory of the m3u8 file \"{}\" does not exist", playlist.display()),
                "m3u8",
            )
        })?;
        let mut remote_dir = options.remote_dir.clone().unwrap_or_default();
        if !remote_dir.is_empty() {
            check_pattern(&remote_dir, &REMOTE_DIR_PATTERN, "remote_dir")?;
        }
        let hls_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let max_bytes = self.config().upload_chunk_size as u64;
        let max_files = self.config().upload_max_files;
        debug!("HLS upload limits: {} B and {} files per request", max_bytes, max_files);

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| ClientError::io(e, &dir))?;
        let mut fragments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ClientError::io(e, &dir))? {
            let path = entry.path();
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| ClientError::io(e, &path))?;
            if !metadata.is_file() {
                warn!(
                    "Found an element which is not a file in the fragments dir: \"{}\", it will be ignored",
                    path.display()
                );
                continue;
            }
            fragments.push((path, metadata.len()));
        }
        fragments.sort_by(|(a, _), (b, _)| a.file_name().cmp(&b.file_name()));

        info!("Uploading HLS \"{}\" ({} fragments)", playlist.display(), fragments.len());
        let total_files = fragments.len() + 1;
        let mut sent_files = 0;
        let mut stats = TransferStats::start();
        let mut batch = Batch::default();

        for (path, size) in fragments {
            batch.push(path, size);
            if batch.is_full(max_bytes, max_files) {
                info!(
                    "Uploading {} files ({:.2} MB, only fragments) of \"{}\" in one request",
                    batch.files.len(),
                    batch.bytes as f64 / 1_000_000.0,
                    dir.display()
                );
                let batch = std::mem::take(&mut batch);
                let response = self.send_batch(&batch, &remote_dir, &hls_name, options).await?;
                stats.add(batch.bytes);
                sent_files += batch.files.len();
                report(&mut progress, sent_files as f64 / total_files as f64);
                if remote_dir.is_empty() {
                    remote_dir = dir_name_from(&response, &self.full_url(SEGMENTED_UPLOAD_URI))?;
                }
            }
        }

        let size = tokio::fs::metadata(playlist).await.map_err(|e| ClientError::io(e, playlist))?.len();
        batch.push(playlist.to_path_buf(), size);
        info!(
            "Uploading {} files ({:.2} MB, fragments and the playlist) of \"{}\" in one request",
            batch.files.len(),
            batch.bytes as f64 / 1_000_000.0,
            dir.display()
        );
        let response = self.send_batch(&batch, &remote_dir, &hls_name, options).await?;
        stats.add(batch.bytes);
        if remote_dir.is_empty() {
            remote_dir = dir_name_from(&response, &self.full_url(SEGMENTED_UPLOAD_URI))?;
        }
        info!(
            "Upload finished ({} files in \"{}\"), average bandwidth: {}",
            total_files,
            remote_dir,
            stats.bandwidth_repr()
        );

        report(&mut progress, 1.0);
        Ok(remote_dir)
    }

    /// Send one batch; file contents are loaded in memory so that no file
    /// stays open across the request
    async fn send_batch(
        &self,
        batch: &Batch,
        remote_dir: &str,
        hls_name: &str,
        options: &SegmentedUploadOptions,
    ) -> Result<Value> {
        let mut req = ApiRequest::post(SEGMENTED_UPLOAD_URI)
            .field("dir_name", remote_dir)
            .field("hls_name", hls_name)
            .timeout(options.timeout)
            .max_retry(options.max_retry);
        for (path, size) in &batch.files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let data = tokio::fs::read(path).await.map_err(|e| {
                ClientError::storage_error_full("Cannot read fragment", path.display().to_string(), e.to_string())
            })?;
            req = req
                .field(name.as_str(), size.to_string())
                .file(FilePart::from_bytes(name.as_str(), name.as_str(), data));
        }
        self.api_json(req).await
    }
}

fn dir_name_from(response: &Value, url: &str) -> Result<String> {
    response
        .get("dir_name")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ClientError::invalid_response("The response has no \"dir_name\"", url))
}
