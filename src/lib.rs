//! mediaserver-client
//!
//! Client for the MediaServer HTTP API: authenticated requests with retries,
//! chunked and segmented uploads, resumable downloads, backup archives, and
//! catalog and users management.

pub mod api;
pub mod cli;
pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod media;
pub mod transfer;
pub mod users;

pub use error::{ClientError, Result};

pub use api::{ApiRequest, ApiResponse, Method, RetryPolicy, ServerCapabilities, ServerVersion, Transport};
pub use client::MediaServerClient;
pub use config::{ClientConfig, ConfigOverrides, ConfigSource, ProxySettings};
pub use content::{Catalog, CatalogFormat};
pub use media::{ItemKind, MediaResource, RemoteItem};
pub use transfer::{
    AnnotationScope, BackupOptions, BackupOutcome, DownloadOutcome, LocalSize, MetadataOptions, ProgressCallback,
    ResourceOptions, SegmentedUploadOptions, UploadOptions,
};
pub use users::{UserImport, UserRecord};
