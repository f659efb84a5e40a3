//! MediaServer API client
//!
//! [`MediaServerClient`] owns the resolved configuration, the transport and
//! the cached server capabilities. Transfer operations (uploads, downloads,
//! backups) are implemented on it in the [`transfer`](crate::transfer)
//! module.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::api::{
    ApiRequest, ApiResponse, Executor, ReqwestTransport, RetryDecision, RetryPolicy, ServerCapabilities,
    ServerVersion, Transport,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::media::{ItemKind, RemoteItem};
use crate::transfer::{ProgressCallback, UploadOptions};

/// Client for the MediaServer HTTP API
///
/// The client is cheap to share behind an `Arc`; concurrent calls only
/// share the connection pool and the capability cache.
pub struct MediaServerClient {
    config: Arc<ClientConfig>,
    executor: Executor,
    retry: RetryPolicy,
    capabilities: OnceCell<ServerCapabilities>,
}

impl MediaServerClient {
    /// Create a client using the `reqwest` transport
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config));
        Self::with_transport(config, transport)
    }

    /// Create a client over a custom transport
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            retry: RetryPolicy::from_config(&config),
            executor: Executor::new(config.clone(), transport),
            config,
            capabilities: OnceCell::new(),
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Absolute URL of an API URI
    pub fn full_url(&self, uri: &str) -> String {
        self.executor.resolve_url(uri)
    }

    /// Server capabilities, negotiated on first use and cached
    pub async fn capabilities(&self) -> Result<&ServerCapabilities> {
        self.capabilities
            .get_or_try_init(|| async {
                let mut probe = ApiRequest::get("/").unauthenticated();
                let caps = self
                    .executor
                    .execute(&mut probe, None)
                    .await
                    .and_then(ApiResponse::into_json)
                    .and_then(|root| ServerCapabilities::from_root_response(&root))
                    .map_err(|e| e.with_context("Failed to get MediaServer version"))?;
                debug!("MediaServer version is: {}", caps.version);
                Ok::<_, ClientError>(caps)
            })
            .await
    }

    /// Version advertised by the server
    pub async fn server_version(&self) -> Result<ServerVersion> {
        Ok(self.capabilities().await?.version)
    }

    /// Perform a single attempt, without retrying
    pub async fn request(&self, req: &mut ApiRequest) -> Result<ApiResponse> {
        let auth = if req.authenticate && !self.config.api_key.is_empty() {
            Some(self.capabilities().await?.auth)
        } else {
            None
        };
        self.executor.execute(req, auth).await
    }

    /// Perform a call, retrying transient failures
    ///
    /// The request's own `max_retry` wins over the configured one. File
    /// sources are rewound to their start before every new attempt.
    pub async fn api(&self, mut req: ApiRequest) -> Result<ApiResponse> {
        let policy = match req.max_retry {
            Some(max_retry) => self.retry.clone().with_max_retry(max_retry),
            None => self.retry.clone(),
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.request(&mut req).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };
            match policy.decide(attempt, &err, &req.uri) {
                RetryDecision::GiveUp => return Err(err),
                RetryDecision::Retry(delay) => {
                    tokio::time::sleep(delay).await;
                    if !req.files.is_empty() {
                        debug!("Seeking {} file part(s) to 0", req.files.len());
                        req.rewind_files()?;
                    }
                }
            }
        }
    }

    /// Perform a call and decode its JSON body
    pub async fn api_json(&self, req: ApiRequest) -> Result<Value> {
        let url = self.full_url(&req.uri);
        match self.api(req).await? {
            ApiResponse::Json(value) => Ok(value),
            _ => Err(ClientError::invalid_response("Expected a JSON response", url)),
        }
    }

    /// Call the API root
    pub async fn check_server(&self) -> Result<Value> {
        self.api_json(ApiRequest::get("/")).await
    }

    /// Fetch the title of a media or channel
    pub async fn get_item(&self, oid: &str) -> Result<RemoteItem> {
        let uri = match RemoteItem::new(oid, "").kind() {
            ItemKind::Channel => "channels/get/",
            _ => "medias/get/",
        };
        let response = self.api_json(ApiRequest::get(uri).param("oid", oid)).await?;
        let info = response.get("info").cloned().unwrap_or(Value::Null);
        serde_json::from_value(info)
            .map_err(|e| ClientError::invalid_response(format!("Invalid item info: {}", e), self.full_url(uri)))
    }

    /// Create a media, uploading its file first if one is given
    ///
    /// `metadata` holds extra form fields passed to `medias/add/`.
    pub async fn add_media(
        &self,
        title: Option<&str>,
        file: Option<&Path>,
        metadata: &[(String, String)],
        progress: Option<ProgressCallback<'_>>,
    ) -> Result<Value> {
        let title = title.filter(|t| !t.is_empty());
        if title.is_none() && file.is_none() {
            return Err(ClientError::validation_error("A title or a file is required to create a media"));
        }

        let mut req = ApiRequest::post("medias/add/").timeout(std::time::Duration::from_secs(3600));
        for (name, value) in metadata {
            req = req.field(name.clone(), value.clone());
        }
        req = req.field("origin", self.config.client_id.clone());
        if let Some(title) = title {
            req = req.field("title", title);
        }
        if let Some(path) = file {
            let size = tokio::fs::metadata(path)
                .await
                .map_err(|e| ClientError::storage_error_full("Cannot read file", path.display().to_string(), e.to_string()))?
                .len();
            if size == 0 {
                return Err(ClientError::validation_error_with_field(
                    format!("File is empty: {}", path.display()),
                    "file",
                ));
            }
            let upload_id = self.chunked_upload(path, &UploadOptions::default(), progress).await?;
            req = req.field("code", upload_id);
        }

        let response = self.api_json(req).await?;
        if let Some(oid) = response.get("oid").and_then(Value::as_str) {
            info!("Media {} created", oid);
        }
        Ok(response)
    }
}
