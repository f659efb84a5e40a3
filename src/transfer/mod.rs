//! Transfer engines
//!
//! Uploads (chunked and segmented), resumable downloads and backup archives.
//! Every operation is a method of [`MediaServerClient`](crate::MediaServerClient)
//! and goes through its retrying API call path.

pub mod backup;
pub mod download;
pub mod hls;
pub mod stats;
pub mod upload;

pub use backup::{read_markers, verify_archive, ArchiveMarkers, BackupOptions, BackupOutcome};
pub use download::{AnnotationScope, DownloadOutcome, LocalSize, MetadataOptions, ResourceOptions};
pub use hls::SegmentedUploadOptions;
pub use stats::{format_bytes, format_duration, TransferStats};
pub use upload::{chunk_ranges, ChunkRange, UploadOptions};

/// Progress callback, called with a fraction between 0 and 1
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(f64) + Send + 'a);

pub(crate) fn report(progress: &mut Option<ProgressCallback<'_>>, value: f64) {
    if let Some(callback) = progress.as_mut() {
        (*callback)(value);
    }
}
