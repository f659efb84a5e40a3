//! Resumable downloads
//!
//! Metadata archives and media resources are only transferred when the local
//! copy is missing or its size differs from the remote `Content-Length`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::api::{ApiRequest, RawResponse};
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};
use crate::media::{select_best_resource, ItemKind, MediaResource, RemoteItem};
use crate::transfer::backup::verify_archive;
use crate::transfer::stats::TransferStats;

/// Size of the local copy, used to skip unchanged downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalSize {
    /// Read the size of the destination file, if any
    #[default]
    Probe,
    /// Size known by the caller; 0 always downloads
    Known(u64),
}

/// Result of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// A new file was written
    Downloaded(PathBuf),
    /// The local copy already matches the remote size
    Unchanged,
    /// The item has nothing to download
    NoResource,
}

impl DownloadOutcome {
    /// Path of the written file, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            DownloadOutcome::Downloaded(path) => Some(path),
            _ => None,
        }
    }

    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            DownloadOutcome::Downloaded(path) => Some(path),
            _ => None,
        }
    }
}

/// Annotations included in a metadata archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnotationScope {
    #[default]
    All,
    Editorial,
    None,
}

impl AnnotationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationScope::All => "all",
            AnnotationScope::Editorial => "editorial",
            AnnotationScope::None => "none",
        }
    }
}

impl std::str::FromStr for AnnotationScope {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(AnnotationScope::All),
            "editorial" => Ok(AnnotationScope::Editorial),
            "none" => Ok(AnnotationScope::None),
            other => Err(ClientError::validation_error_with_field(
                format!("Invalid value \"{}\", valid values: all, editorial, none", other),
                "annotations",
            )),
        }
    }
}

/// Options for [`MediaServerClient::download_media_metadata`]
#[derive(Debug, Clone)]
pub struct MetadataOptions {
    /// Base name of the archive; defaults to the item's file prefix
    pub file_prefix: Option<String>,
    pub local_size: LocalSize,
    pub annotations: AnnotationScope,
    pub include_resource_links: bool,
    pub timeout: Duration,
    pub max_retry: Option<u32>,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            file_prefix: None,
            local_size: LocalSize::Probe,
            annotations: AnnotationScope::All,
            include_resource_links: true,
            timeout: Duration::from_secs(3600),
            max_retry: None,
        }
    }
}

/// Options for [`MediaServerClient::download_best_resource`]
#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub file_prefix: Option<String>,
    pub local_size: LocalSize,
    /// Only accept the variant used by the player
    pub must_be_playable: bool,
    pub timeout: Duration,
    pub max_retry: Option<u32>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            file_prefix: None,
            local_size: LocalSize::Probe,
            must_be_playable: false,
            timeout: Duration::from_secs(3600),
            max_retry: None,
        }
    }
}

fn check_oid(item: &RemoteItem) -> Result<()> {
    if item.oid.is_empty() {
        return Err(ClientError::validation_error_with_field("An object id is required", "oid"));
    }
    Ok(())
}

async fn resolve_local_size(local_size: LocalSize, path: &Path) -> u64 {
    match local_size {
        LocalSize::Known(size) => size,
        LocalSize::Probe => match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        },
    }
}

fn with_limits(mut req: ApiRequest, timeout: Duration, max_retry: Option<u32>) -> ApiRequest {
    req = req.timeout(timeout);
    if let Some(max_retry) = max_retry {
        req = req.max_retry(max_retry);
    }
    req
}

impl MediaServerClient {
    /// Download the metadata archive of a media
    pub async fn download_media_metadata(
        &self,
        item: &RemoteItem,
        dir: &Path,
        options: &MetadataOptions,
    ) -> Result<DownloadOutcome> {
        check_oid(item)?;
        info!("Downloading metadata for media {}", item.label());

        let endpoint = self.capabilities().await?.metadata_endpoint;
        let params = [
            ("oid", item.oid.as_str()),
            ("annotations", options.annotations.as_str()),
            ("resources", if options.include_resource_links { "yes" } else { "no" }),
        ];
        let build = |req: ApiRequest| {
            let req = params.iter().fold(req, |req, (k, v)| req.param(*k, *v));
            with_limits(req, options.timeout, options.max_retry)
        };

        tokio::fs::create_dir_all(dir).await.map_err(|e| ClientError::io(e, dir))?;
        let prefix = options.file_prefix.clone().unwrap_or_else(|| item.file_prefix());
        let path = dir.join(format!("{}.zip", prefix));

        let local_size = resolve_local_size(options.local_size, &path).await;
        if local_size > 0 && self.probe_remote_size(build(ApiRequest::head(endpoint)), &item.oid).await? == Some(local_size) {
            info!("Skipping download of \"{}\", the file already exists and has the expected size", path.display());
            return Ok(DownloadOutcome::Unchanged);
        }

        let response = self.api(build(ApiRequest::get(endpoint)).streaming()).await?.into_raw()?;
        self.stream_to_file(response, &path).await?;

        let check_path = path.clone();
        tokio::task::spawn_blocking(move || verify_archive(&check_path)).await??;
        Ok(DownloadOutcome::Downloaded(path))
    }

    /// Download the best resource file of a media
    pub async fn download_best_resource(
        &self,
        item: &RemoteItem,
        dir: &Path,
        options: &ResourceOptions,
    ) -> Result<DownloadOutcome> {
        check_oid(item)?;
        if item.kind() != ItemKind::Video {
            info!("The media {} is not a video, skipping resource download", item.oid);
            return Ok(DownloadOutcome::NoResource);
        }
        info!("Downloading resource for media {}", item.label());

        let listing = self
            .api_json(ApiRequest::get("medias/resources-list/").param("oid", item.oid.as_str()))
            .await?;
        let resources: Vec<MediaResource> = serde_json::from_value(listing.get("resources").cloned().unwrap_or(Value::Null))
            .map_err(|e| {
                ClientError::invalid_response(
                    format!("Invalid resources list: {}", e),
                    self.full_url("medias/resources-list/"),
                )
            })?;
        if resources.is_empty() {
            info!("The media {} has no resource", item.oid);
            return Ok(DownloadOutcome::NoResource);
        }

        let best = select_best_resource(&resources, options.must_be_playable).ok_or_else(|| {
            warn!("No resource file can be downloaded for video {}: {:?}", item.oid, resources);
            ClientError::unsupported(format!(
                "No downloadable resource for media {} (playable variant required: {})",
                item.oid, options.must_be_playable
            ))
        })?;
        info!("Best quality file for video {}: {}", item.oid, best.file);

        tokio::fs::create_dir_all(dir).await.map_err(|e| ClientError::io(e, dir))?;
        let prefix = options.file_prefix.clone().unwrap_or_else(|| item.file_prefix());
        let path = dir.join(format!("{}{}", prefix, best.file_suffix()));
        let local_size = resolve_local_size(options.local_size, &path).await;

        if best.is_external() {
            // Only the external reference is stored.
            let data = best.file.as_bytes();
            if local_size > 0 && local_size == data.len() as u64 {
                info!("Skipping download of \"{}\", the file already exists and has the expected size", path.display());
                return Ok(DownloadOutcome::Unchanged);
            }
            tokio::fs::write(&path, data).await.map_err(|e| ClientError::io(e, &path))?;
            return Ok(DownloadOutcome::Downloaded(path));
        }

        let link = self
            .api_json(
                ApiRequest::get("download/")
                    .param("oid", item.oid.as_str())
                    .param("url", best.path.as_str())
                    .param("redirect", "no"),
            )
            .await?;
        let url = link
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::invalid_response("The download link has no url", self.full_url("download/")))?
            .to_string();

        let build = |req: ApiRequest| with_limits(req.unauthenticated(), options.timeout, options.max_retry);
        if local_size > 0 && self.probe_remote_size(build(ApiRequest::head(url.as_str())), &item.oid).await? == Some(local_size) {
            info!("Skipping download of \"{}\", the file already exists and has the expected size", path.display());
            return Ok(DownloadOutcome::Unchanged);
        }

        let response = self.api(build(ApiRequest::get(url.as_str())).streaming()).await?.into_raw()?;
        self.stream_to_file(response, &path).await?;
        Ok(DownloadOutcome::Downloaded(path))
    }

    /// Remote size from a HEAD request; `None` when the length is missing or zero
    async fn probe_remote_size(&self, head: ApiRequest, oid: &str) -> Result<Option<u64>> {
        let response = self.api(head).await?.into_raw()?;
        match response.content_length().filter(|size| *size > 0) {
            Some(size) => Ok(Some(size)),
            None => {
                warn!(
                    "Failed to get expected size of {}: Content-Length is {:?}",
                    oid,
                    response.header("content-length")
                );
                Ok(None)
            }
        }
    }

    /// Write a response body to `path`, returning the number of bytes written
    async fn stream_to_file(&self, response: RawResponse, path: &Path) -> Result<u64> {
        let file = tokio::fs::File::create(path).await.map_err(|e| {
            ClientError::storage_error_full("Cannot create file", path.display().to_string(), e.to_string())
        })?;
        let mut writer = tokio::io::BufWriter::with_capacity(self.config().download_chunk_size, file);
        let mut stats = TransferStats::start();
        let mut body = response.into_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await.map_err(|e| ClientError::io(e, path))?;
            stats.add(chunk.len() as u64);
        }
        writer.flush().await.map_err(|e| ClientError::io(e, path))?;
        info!(
            "Download of \"{}\" finished ({} bytes), average bandwidth was {}",
            path.display(),
            stats.bytes(),
            stats.bandwidth_repr()
        );
        Ok(stats.bytes())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::mock::{is_version_probe, json_response, test_client, test_config, version_response, MockTransport};
    use crate::api::{Method, PreparedRequest};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    /// Small valid zip archive
    pub(crate) fn sample_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Answer metadata requests with `zip` and resource requests with `resource`
    pub(crate) fn media_server(
        zip: Vec<u8>,
        resource: Vec<u8>,
    ) -> impl FnMut(&PreparedRequest) -> Result<RawResponse> + Send + 'static {
        move |req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            let body_for = |data: &Vec<u8>| match req.method {
                Method::Head => RawResponse::buffered(200, "").with_header("Content-Length", data.len().to_string()),
                _ => RawResponse::buffered(200, data.clone()),
            };
            if req.url.contains("/download/metadata/") {
                return Ok(body_for(&zip));
            }
            if req.url.contains("cdn.test") {
                return Ok(body_for(&resource));
            }
            if req.url.contains("/medias/resources-list/") {
                return Ok(json_response(
                    200,
                    json!({"resources": [
                        {"file": "media.mp4", "path": "/r/media.mp4", "format": "mp4", "file_size": resource.len(),
                         "width": 640, "height": 360, "used_for_display": true},
                        {"file": "media.m3u8", "format": "m3u8", "file_size": 999999}
                    ]}),
                ));
            }
            if req.url.contains("/download/") {
                return Ok(json_response(200, json!({"url": "https://cdn.test/media.mp4"})));
            }
            if req.url.contains("/channels/path/") {
                return Ok(json_response(
                    200,
                    json!({"path": [{"oid": "c1", "title": "Lectures"}, {"oid": "c2", "title": "Math/Physics"}]}),
                ));
            }
            Ok(json_response(404, json!({"error": "unknown endpoint"})))
        }
    }

    #[tokio::test]
    async fn test_metadata_second_call_only_probes() {
        let dir = tempfile::tempdir().unwrap();
        let zip = sample_zip(&[("media.json", b"{\"oid\": \"v1\"}")]);
        let transport = Arc::new(MockTransport::new(media_server(zip.clone(), Vec::new())));
        let client = test_client(test_config(), transport.clone());
        let item = RemoteItem::new("v1", "Talk");

        let first = client.download_media_metadata(&item, dir.path(), &MetadataOptions::default()).await.unwrap();
        let path = first.path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("Talk - v1.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), zip);

        let before = transport.requests().len();
        let second = client.download_media_metadata(&item, dir.path(), &MetadataOptions::default()).await.unwrap();
        assert_eq!(second, DownloadOutcome::Unchanged);
        let after: Vec<_> = transport.requests().split_off(before);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].method, Method::Head);
        assert_eq!(after[0].query_value("annotations"), Some("all"));
    }

    #[tokio::test]
    async fn test_known_zero_forces_download() {
        let dir = tempfile::tempdir().unwrap();
        let zip = sample_zip(&[("media.json", b"{}")]);
        let transport = Arc::new(MockTransport::new(media_server(zip, Vec::new())));
        let client = test_client(test_config(), transport.clone());
        let item = RemoteItem::new("v1", "Talk");
        client.download_media_metadata(&item, dir.path(), &MetadataOptions::default()).await.unwrap();

        let options = MetadataOptions {
            local_size: LocalSize::Known(0),
            ..MetadataOptions::default()
        };
        let outcome = client.download_media_metadata(&item, dir.path(), &options).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Downloaded(_)));
        assert_eq!(transport.count(Method::Head, "/download/metadata/"), 0);
        assert_eq!(transport.count(Method::Get, "/download/metadata/"), 2);
    }

    #[tokio::test]
    async fn test_missing_content_length_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let zip = sample_zip(&[("media.json", b"{}")]);
        let served = zip.clone();
        let transport = Arc::new(MockTransport::new(move |req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            match req.method {
                Method::Head => Ok(RawResponse::buffered(200, "")),
                _ => Ok(RawResponse::buffered(200, served.clone())),
            }
        }));
        let client = test_client(test_config(), transport.clone());
        let options = MetadataOptions {
            local_size: LocalSize::Known(zip.len() as u64),
            ..MetadataOptions::default()
        };
        let outcome = client.download_media_metadata(&RemoteItem::new("v1", ""), dir.path(), &options).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Downloaded(_)));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(media_server(b"not a zip".to_vec(), Vec::new())));
        let client = test_client(test_config(), transport);
        let err = client
            .download_media_metadata(&RemoteItem::new("v1", "x"), dir.path(), &MetadataOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_best_resource_download_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let resource = vec![3u8; 64];
        let transport = Arc::new(MockTransport::new(media_server(Vec::new(), resource.clone())));
        let client = test_client(test_config(), transport.clone());
        let item = RemoteItem::new("v9", "Clip");

        let outcome = client.download_best_resource(&item, dir.path(), &ResourceOptions::default()).await.unwrap();
        let path = outcome.into_path().unwrap();
        assert_eq!(path, dir.path().join("Clip - v9-640x360.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), resource);

        let sent = transport.requests();
        let cdn_get = sent.iter().find(|r| r.url.contains("cdn.test")).unwrap();
        assert!(cdn_get.header("api-key").is_none());
        let link = sent.iter().find(|r| r.url.ends_with("/api/v2/download/")).unwrap();
        assert_eq!(link.query_value("redirect"), Some("no"));
        assert_eq!(link.query_value("url"), Some("/r/media.mp4"));

        let outcome = client.download_best_resource(&item, dir.path(), &ResourceOptions::default()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Unchanged);
        assert_eq!(transport.count(Method::Get, "cdn.test"), 1);
        assert_eq!(transport.count(Method::Head, "cdn.test"), 1);
    }

    #[tokio::test]
    async fn test_non_video_has_no_resource() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(media_server(Vec::new(), Vec::new())));
        let client = test_client(test_config(), transport.clone());
        let outcome = client
            .download_best_resource(&RemoteItem::new("l12", "Live"), dir.path(), &ResourceOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, DownloadOutcome::NoResource);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_playable_requirement_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            Ok(json_response(
                200,
                json!({"resources": [{"file": "a.mp4", "format": "mp4", "file_size": 10, "used_for_display": false}]}),
            ))
        }));
        let client = test_client(test_config(), transport);
        let options = ResourceOptions {
            must_be_playable: true,
            ..ResourceOptions::default()
        };
        let err = client
            .download_best_resource(&RemoteItem::new("v1", ""), dir.path(), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_external_resource_written_as_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new(|req| {
            if is_version_probe(req) {
                return Ok(version_response("13.2.0"));
            }
            Ok(json_response(
                200,
                json!({"resources": [{"file": "dQw4w9WgXcQ", "format": "youtube", "file_size": 0}]}),
            ))
        }));
        let client = test_client(test_config(), transport);
        let outcome = client
            .download_best_resource(&RemoteItem::new("v1", "Yt"), dir.path(), &ResourceOptions::default())
            .await
            .unwrap();
        let path = outcome.into_path().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "dQw4w9WgXcQ");
    }
}
