//! Chunked upload
//!
//! A file is sent as a sequence of range-addressed chunks, strictly in
//! offset order. The first chunk response assigns an upload id which every
//! following chunk and the completion call must echo.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use md5::{Digest, Md5};
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::api::{ApiRequest, ApiResponse, CompletionCheck, FilePart, RetryDecision, RetryPolicy};
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};
use crate::transfer::stats::TransferStats;
use crate::transfer::{report, ProgressCallback};

/// Share of the progress reserved for the chunks; completion brings it to 1
const CHUNKS_PROGRESS_SHARE: f64 = 0.9;

static REMOTE_PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{10,50}/.+$").expect("remote path pattern is valid"));

/// Inclusive byte range of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Split `total` bytes into contiguous ranges of at most `chunk_size` bytes
pub fn chunk_ranges(total: u64, chunk_size: u64) -> Vec<ChunkRange> {
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total) - 1;
        ranges.push(ChunkRange { start, end, total });
        start = end + 1;
    }
    ranges
}

/// Options for [`MediaServerClient::chunked_upload`]
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Server-side destination, `{remote dir}/{file path}`
    pub remote_path: Option<String>,
    /// Timeout of each chunk and of the completion call
    pub timeout: Duration,
    pub max_retry: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            remote_path: None,
            timeout: Duration::from_secs(300),
            max_retry: 10,
        }
    }
}

/// Server answer to one chunk
#[derive(Debug)]
enum ChunkAck {
    Accepted(Value),
    /// The chunk was stored by an earlier attempt whose answer was lost
    AlreadyReceived,
}

pub(crate) fn check_pattern(value: &str, pattern: &Regex, field: &str) -> Result<()> {
    if !pattern.is_match(value) {
        return Err(ClientError::validation_error_with_field(
            format!("Invalid \"{}\" value: \"{}\"", field, value),
            field,
        ));
    }
    Ok(())
}

/// Offset reported by the server in a 400 answer
fn reported_offset(err: &ClientError) -> Option<u64> {
    match err.body()?.get("offset")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl MediaServerClient {
    /// Upload a file in chunks and return its upload id
    pub async fn chunked_upload(
        &self,
        path: &Path,
        options: &UploadOptions,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<String> {
        if let Some(remote_path) = options.remote_path.as_deref().filter(|p| !p.is_empty()) {
            check_pattern(remote_path, &REMOTE_PATH_PATTERN, "remote_path")?;
        }
        let caps = self.capabilities().await?.clone();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::validation_error_with_field(format!("Invalid file path \"{}\"", path.display()), "file"))?;

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ClientError::storage_error_full("Cannot open file", path.display().to_string(), e.to_string()))?;
        let total = file.metadata().await.map_err(|e| ClientError::io(e, path))?.len();
        if total == 0 {
            return Err(ClientError::validation_error_with_field(format!("File is empty: {}", path.display()), "file"));
        }

        let ranges = chunk_ranges(total, self.config().upload_chunk_size as u64);
        let policy = self.retry_policy().clone().with_max_retry(options.max_retry);
        let uri = format!("{}upload/", caps.upload_prefix);
        let mut checksum = (caps.completion_check == CompletionCheck::Checksum).then(Md5::new);
        let mut upload_id: Option<String> = None;
        let mut stats = TransferStats::start();

        info!("Uploading file \"{}\" ({} bytes, {} chunks)", file_name, total, ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            debug!("Uploading chunk {}/{} ({})", index + 1, ranges.len(), range.content_range());
            let mut chunk = vec![0u8; range.len() as usize];
            file.read_exact(&mut chunk).await.map_err(|e| ClientError::io(e, path))?;
            if let Some(hasher) = checksum.as_mut() {
                hasher.update(&chunk);
            }

            let mut req = ApiRequest::post(uri.as_str())
                .header("Content-Range", range.content_range())
                .timeout(options.timeout)
                .file(FilePart::from_bytes("file", file_name.as_str(), chunk));
            if let Some(id) = &upload_id {
                req = req.field("upload_id", id.as_str());
            }

            match self.send_chunk(req, range, upload_id.is_some(), &policy).await? {
                ChunkAck::Accepted(response) if upload_id.is_none() => {
                    let id = response.get("upload_id").and_then(Value::as_str).ok_or_else(|| {
                        ClientError::invalid_response("The first chunk response has no upload id", self.full_url(&uri))
                    })?;
                    upload_id = Some(id.to_string());
                }
                _ => {}
            }
            stats.add(range.len());
            report(&mut progress, CHUNKS_PROGRESS_SHARE * range.end as f64 / total as f64);
        }
        info!("Upload finished, average bandwidth was {}", stats.bandwidth_repr());

        let upload_id = upload_id
            .ok_or_else(|| ClientError::invalid_response("No upload id received", self.full_url(&uri)))?;
        let mut complete = ApiRequest::post(format!("{}upload/complete/", caps.upload_prefix))
            .field("upload_id", upload_id.as_str())
            .field("expected_size", total.to_string())
            .timeout(options.timeout)
            .max_retry(options.max_retry);
        complete = match checksum {
            Some(hasher) => complete.field("md5", hex::encode(hasher.finalize())),
            None => complete.field("no_md5", "yes"),
        };
        if let Some(remote_path) = options.remote_path.as_deref().filter(|p| !p.is_empty()) {
            complete = complete.field("path", remote_path);
        }
        self.api(complete).await?;

        report(&mut progress, 1.0);
        Ok(upload_id)
    }

    /// Send one chunk, retrying transient failures
    ///
    /// A 400 whose reported offset is the byte right after this chunk, on a
    /// retry of a chunk that is not the first, means the chunk was stored.
    async fn send_chunk(
        &self,
        mut req: ApiRequest,
        range: &ChunkRange,
        has_upload_id: bool,
        policy: &RetryPolicy,
    ) -> Result<ChunkAck> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.request(&mut req).await {
                Ok(ApiResponse::Json(value)) => return Ok(ChunkAck::Accepted(value)),
                Ok(_) => return Ok(ChunkAck::Accepted(Value::Null)),
                Err(err) => err,
            };

            if let ClientError::Http { status: 400, .. } = err {
                if attempt > 1 && has_upload_id && reported_offset(&err) == Some(range.end + 1) {
                    warn!(
                        "Offset mismatch on chunk {}, the server already has it, ignoring error: {}",
                        range.content_range(),
                        err
                    );
                    return Ok(ChunkAck::AlreadyReceived);
                }
                error!(
                    "Chunk upload failed, tried {} times (no retry for the status code 400 in chunk upload)",
                    attempt
                );
                return Err(err);
            }

            match policy.decide(attempt, &err, &req.uri) {
                RetryDecision::GiveUp => return Err(err),
                RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{is_version_probe, json_response, test_client, test_config, version_response, MockTransport};
    use crate::api::{Method, RawResponse};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_twelve_mib_in_five_mib_chunks() {
        let ranges = chunk_ranges(12_582_912, 5_242_880);
        assert_eq!(ranges.len(), 3);
        let lens: Vec<u64> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, vec![5_242_880, 5_242_880, 2_097_152]);
        assert_eq!(ranges[0].content_range(), "bytes 0-5242879/12582912");
        assert_eq!(ranges[1].content_range(), "bytes 5242880-10485759/12582912");
        assert_eq!(ranges[2].content_range(), "bytes 10485760-12582911/12582912");
    }

    #[test]
    fn test_ranges_are_contiguous() {
        for (total, chunk) in [(1u64, 1u64), (10, 3), (9, 3), (7, 100)] {
            let ranges = chunk_ranges(total, chunk);
            assert_eq!(ranges.len() as u64, total.div_ceil(chunk));
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, total - 1);
            for pair in ranges.windows(2) {
                assert_eq!(pair[1].start, pair[0].end + 1);
            }
        }
        assert!(chunk_ranges(0, 10).is_empty());
    }

    #[test]
    fn test_remote_path_pattern() {
        assert!(check_pattern("abcdefghij/video.mp4", &REMOTE_PATH_PATTERN, "remote_path").is_ok());
        assert!(check_pattern("short/video.mp4", &REMOTE_PATH_PATTERN, "remote_path").is_err());
        assert!(check_pattern("abcdefghij/", &REMOTE_PATH_PATTERN, "remote_path").is_err());
        let err = check_pattern("bad dir/video.mp4", &REMOTE_PATH_PATTERN, "remote_path").unwrap_err();
        assert!(matches!(err, ClientError::Validation { .. }));
        assert!(err.to_string().contains("bad dir/video.mp4"));
    }

    fn write_file(dir: &tempfile::TempDir, size: usize) -> std::path::PathBuf {
        let path = dir.path().join("video.mp4");
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_id_echoed_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 25);
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            if req.url.ends_with("/upload/complete/") {
                return Ok(json_response(200, json!({"success": true})));
            }
            Ok(json_response(200, json!({"upload_id": "up-42", "offset": 0})))
        }));
        let mut config = test_config();
        config.upload_chunk_size = 10;
        let client = test_client(config, transport.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut callback = move |value: f64| sink.lock().unwrap().push(value);
        let id = client
            .chunked_upload(&path, &UploadOptions::default(), Some(&mut callback))
            .await
            .unwrap();
        assert_eq!(id, "up-42");

        let sent = transport.requests();
        let chunks: Vec<_> = sent.iter().filter(|r| r.url.ends_with("/upload/")).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].form_value("upload_id"), None);
        assert_eq!(chunks[1].form_value("upload_id"), Some("up-42"));
        assert_eq!(chunks[2].form_value("upload_id"), Some("up-42"));
        assert_eq!(chunks[2].header("Content-Range"), Some("bytes 20-24/25"));
        assert_eq!(chunks[2].files[0].field, "file");
        assert_eq!(chunks[2].files[0].data.len(), 5);

        let complete = sent.last().unwrap();
        assert!(complete.url.ends_with("/upload/complete/"));
        assert_eq!(complete.form_value("upload_id"), Some("up-42"));
        assert_eq!(complete.form_value("expected_size"), Some("25"));
        assert_eq!(complete.form_value("no_md5"), Some("yes"));

        let values = seen.lock().unwrap().clone();
        assert_eq!(values.len(), 4);
        assert!(values[..3].iter().all(|v| *v <= 0.9));
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values[3], 1.0);
    }

    #[tokio::test]
    async fn test_legacy_server_gets_checksum_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 4);
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("8.1.0"));
            }
            Ok(json_response(200, json!({"success": true, "upload_id": "old"})))
        }));
        let client = test_client(test_config(), transport.clone());
        client.chunked_upload(&path, &UploadOptions::default(), None).await.unwrap();

        let sent = transport.requests();
        assert!(sent[1].url.ends_with("/api/v2/medias/resource/upload/"));
        let complete = sent.last().unwrap();
        assert!(complete.url.ends_with("/medias/resource/upload/complete/"));
        let expected = hex::encode(Md5::digest([0u8, 1, 2, 3]));
        assert_eq!(complete.form_value("md5"), Some(expected.as_str()));
        assert_eq!(complete.form_value("no_md5"), None);
    }

    #[tokio::test]
    async fn test_lost_ack_offset_mismatch_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 20);
        let mut second_chunk_calls = 0;
        let transport = Arc::new(MockTransport::new(move |req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            if req.url.ends_with("/upload/complete/") {
                return Ok(json_response(200, json!({})));
            }
            if req.header("Content-Range") == Some("bytes 10-19/20") {
                second_chunk_calls += 1;
                if second_chunk_calls == 1 {
                    return Err(crate::error::ClientError::connection("reset", req.url.clone()));
                }
                return Ok(json_response(400, json!({"error": "bad offset", "offset": 20})));
            }
            Ok(json_response(200, json!({"upload_id": "u1"})))
        }));
        let mut config = test_config();
        config.upload_chunk_size = 10;
        let client = test_client(config, transport.clone());
        let id = client.chunked_upload(&path, &UploadOptions::default(), None).await.unwrap();
        assert_eq!(id, "u1");
        assert_eq!(transport.count(Method::Post, "/upload/complete/"), 1);
    }

    #[tokio::test]
    async fn test_offset_mismatch_on_first_attempt_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 20);
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            if req.header("Content-Range") == Some("bytes 10-19/20") {
                return Ok(json_response(400, json!({"offset": 20})));
            }
            Ok(json_response(200, json!({"upload_id": "u1"})))
        }));
        let mut config = test_config();
        config.upload_chunk_size = 10;
        let client = test_client(config, transport.clone());
        let err = client.chunked_upload(&path, &UploadOptions::default(), None).await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert_eq!(transport.count(Method::Post, "/upload/complete/"), 0);
    }

    #[tokio::test]
    async fn test_server_errors_retried_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 5);
        let mut failures = 2;
        let transport = Arc::new(MockTransport::new(move |req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            if req.url.ends_with("/upload/") && failures > 0 {
                failures -= 1;
                return Ok(RawResponse::buffered(503, "busy"));
            }
            Ok(json_response(200, json!({"upload_id": "u9"})))
        }));
        let client = test_client(test_config(), transport.clone());
        let options = UploadOptions {
            max_retry: 2,
            ..UploadOptions::default()
        };
        client.chunked_upload(&path, &options, None).await.unwrap();
        let chunk_calls = transport.requests().iter().filter(|r| r.url.ends_with("/upload/")).count();
        assert_eq!(chunk_calls, 3);
    }
}
