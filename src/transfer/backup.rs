//! Backup archives
//!
//! One zip archive per media: the metadata archive served by the server,
//! the best resource file and two marker entries. The markers record what
//! the archive was built from so that the next run can skip unchanged
//! downloads.
//!
//! An archive is replaced by renaming a fully written and verified
//! temporary file over it. Temporary files left by a failed run are kept.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::api::ApiRequest;
use crate::client::MediaServerClient;
use crate::error::{ClientError, Result};
use crate::media::RemoteItem;
use crate::transfer::download::{LocalSize, MetadataOptions, ResourceOptions};

/// Entry holding the byte size of the metadata archive
pub const METADATA_SIZE_ENTRY: &str = "metadata-size.txt";

/// Entry holding the slash-joined channel path
pub const METADATA_PATH_ENTRY: &str = "metadata-path.txt";

/// Prefix of the entry holding the resource file
pub const RESOURCE_ENTRY_PREFIX: &str = "resource-";

/// Resources above this size need zip64 records
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Bookkeeping recovered from an existing archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveMarkers {
    /// Size of the metadata archive the backup was built from (0 if unknown)
    pub metadata_size: u64,
    /// Uncompressed size of the resource entry (0 if none)
    pub resource_size: u64,
    pub channel_path: Option<String>,
}

/// Result of a backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// The archive was created or replaced
    Written(PathBuf),
    /// The existing archive already matches the remote media
    UpToDate(PathBuf),
}

impl BackupOutcome {
    pub fn path(&self) -> &Path {
        match self {
            BackupOutcome::Written(path) | BackupOutcome::UpToDate(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub must_be_playable: bool,
    /// Nest the archive under one directory per parent channel
    pub replicate_tree: bool,
}

/// Read the marker entries of an archive
pub fn read_markers(path: &Path) -> Result<ArchiveMarkers> {
    read_marker_entries(path).map_err(|e| e.with_path(path))
}

fn read_marker_entries(path: &Path) -> Result<ArchiveMarkers> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut markers = ArchiveMarkers::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        if name == METADATA_SIZE_ENTRY {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            markers.metadata_size = text.trim().parse().map_err(|_| {
                ClientError::integrity_with_path(
                    format!("Invalid {} content: \"{}\"", METADATA_SIZE_ENTRY, text),
                    path.display().to_string(),
                )
            })?;
        } else if name == METADATA_PATH_ENTRY {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            markers.channel_path = Some(text);
        } else if name.starts_with(RESOURCE_ENTRY_PREFIX) {
            markers.resource_size = entry.size();
        }
    }
    Ok(markers)
}

/// Read every entry of an archive, checking their CRC
pub fn verify_archive(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| ClientError::io(e, path))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| ClientError::integrity_with_path(e.to_string(), path.display().to_string()))?;
    let mut corrupt = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ClientError::integrity_with_path(e.to_string(), path.display().to_string()))?;
        if io::copy(&mut entry, &mut io::sink()).is_err() {
            corrupt.push(entry.name().to_string());
        }
    }
    if !corrupt.is_empty() {
        return Err(ClientError::integrity_with_path(
            format!("Some files have errors in the zip file: {}", corrupt.join(", ")),
            path.display().to_string(),
        ));
    }
    Ok(())
}

/// Append the resource and the marker entries to a metadata archive
pub fn compose_archive(
    metadata_path: &Path,
    resource: Option<(&Path, &str)>,
    metadata_size: u64,
    channel_path: &str,
) -> Result<()> {
    append_entries(metadata_path, resource, metadata_size, channel_path).map_err(|e| e.with_path(metadata_path))
}

fn append_entries(
    metadata_path: &Path,
    resource: Option<(&Path, &str)>,
    metadata_size: u64,
    channel_path: &str,
) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(metadata_path)?;
    let mut writer = ZipWriter::new_append(file)?;
    let stored = || SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    writer.start_file(METADATA_SIZE_ENTRY, stored())?;
    io::Write::write_all(&mut writer, metadata_size.to_string().as_bytes())?;
    writer.start_file(METADATA_PATH_ENTRY, stored())?;
    io::Write::write_all(&mut writer, channel_path.as_bytes())?;

    if let Some((path, entry_name)) = resource {
        let mut source = File::open(path).map_err(|e| ClientError::io(e, path))?;
        let size = source.metadata().map_err(|e| ClientError::io(e, path))?.len();
        writer.start_file(entry_name, stored().large_file(size >= ZIP64_THRESHOLD))?;
        io::copy(&mut source, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

/// Name of the resource entry: `resource` followed by the downloaded file
/// name without its temporary prefix
fn resource_entry_name(resource_path: &Path, tmp_prefix: &str) -> String {
    let name = resource_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("resource{}", name.strip_prefix(tmp_prefix).unwrap_or(&name))
}

impl MediaServerClient {
    /// Create or refresh the backup archive of a media
    pub async fn backup_media(&self, item: &RemoteItem, dir: &Path, options: &BackupOptions) -> Result<BackupOutcome> {
        if item.oid.is_empty() {
            return Err(ClientError::validation_error_with_field("An object id is required", "oid"));
        }
        info!("Backing up media {}", item.label());

        let channels_url = self.full_url("channels/path/");
        let channels = self
            .api_json(ApiRequest::get("channels/path/").param("oid", item.oid.as_str()))
            .await?;
        let channels: Vec<RemoteItem> = serde_json::from_value(channels.get("path").cloned().unwrap_or(Value::Null))
            .map_err(|e| ClientError::invalid_response(format!("Invalid channel path: {}", e), channels_url))?;
        let channel_path = channels
            .iter()
            .map(|c| c.title.replace('/', "|"))
            .collect::<Vec<_>>()
            .join("/");

        let backup_dir = if options.replicate_tree {
            channels.iter().fold(dir.to_path_buf(), |d, c| d.join(c.file_prefix()))
        } else {
            dir.to_path_buf()
        };
        tokio::fs::create_dir_all(&backup_dir).await.map_err(|e| ClientError::io(e, &backup_dir))?;
        let zip_path = backup_dir.join(format!("{}.zip", item.file_prefix()));

        let markers = if zip_path.is_file() {
            let existing = zip_path.clone();
            let inspect = move || verify_archive(&existing).and_then(|()| read_markers(&existing));
            match tokio::task::spawn_blocking(inspect).await? {
                Ok(markers) => {
                    info!(
                        "The backup archive \"{}\" already exists (metadata size: {} B, resource size: {} B)",
                        zip_path.display(),
                        markers.metadata_size,
                        markers.resource_size
                    );
                    markers
                }
                Err(e) => {
                    warn!("Cannot read the existing backup archive \"{}\", it will be rebuilt: {}", zip_path.display(), e);
                    ArchiveMarkers::default()
                }
            }
        } else {
            ArchiveMarkers::default()
        };

        let tmp_prefix = format!("tmp-{}", item.oid);
        let metadata_options = |local_size| MetadataOptions {
            file_prefix: Some(tmp_prefix.clone()),
            local_size: LocalSize::Known(local_size),
            include_resource_links: false,
            ..MetadataOptions::default()
        };

        let mut metadata = self
            .download_media_metadata(item, &backup_dir, &metadata_options(markers.metadata_size))
            .await?
            .into_path();
        let resource_size = if metadata.is_some() { 0 } else { markers.resource_size };
        let resource = self
            .download_best_resource(
                item,
                &backup_dir,
                &ResourceOptions {
                    file_prefix: Some(tmp_prefix.clone()),
                    local_size: LocalSize::Known(resource_size),
                    must_be_playable: options.must_be_playable,
                    ..ResourceOptions::default()
                },
            )
            .await?
            .into_path();

        if resource.is_some() && metadata.is_none() {
            debug!("The resource of {} changed, downloading its metadata again", item.oid);
            metadata = self
                .download_media_metadata(item, &backup_dir, &metadata_options(0))
                .await?
                .into_path();
        }

        if metadata.is_none() && resource.is_none() {
            info!("The backup archive \"{}\" is up to date", zip_path.display());
            return Ok(BackupOutcome::UpToDate(zip_path));
        }
        let metadata = metadata.ok_or_else(|| {
            ClientError::integrity_with_path("The metadata archive should have been downloaded", zip_path.display().to_string())
        })?;
        let metadata_size = tokio::fs::metadata(&metadata).await.map_err(|e| ClientError::io(e, &metadata))?.len();

        let compose_metadata = metadata.clone();
        let compose_resource = resource.clone();
        let entry_name = resource.as_deref().map(|p| resource_entry_name(p, &tmp_prefix));
        tokio::task::spawn_blocking(move || {
            let resource = compose_resource.as_deref().zip(entry_name.as_deref());
            compose_archive(&compose_metadata, resource, metadata_size, &channel_path)?;
            verify_archive(&compose_metadata)
        })
        .await??;

        tokio::fs::rename(&metadata, &zip_path).await.map_err(|e| ClientError::io(e, &zip_path))?;
        if let Some(resource) = &resource {
            match tokio::fs::remove_file(resource).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ClientError::io(e, resource)),
            }
        }
        info!("The backup archive \"{}\" has been written", zip_path.display());
        Ok(BackupOutcome::Written(zip_path))
    }
}
