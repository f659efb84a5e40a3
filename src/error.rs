//! Error types for the MediaServer client
//!
//! This module defines the single structured error returned by every
//! engine operation. Variants follow the failure classes the retry loop
//! needs to tell apart: connection failures, HTTP failures, logical API
//! failures reported inside a 200 response, and local integrity problems.

use std::fmt;
use std::path::Path;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ClientError>;

/// Comprehensive error type for client operations
#[derive(Debug, Clone)]
pub enum ClientError {
    /// DNS, TCP, TLS or timeout failure (no status code)
    Connection {
        message: String,
        url: String,
    },

    /// Server answered with a non-200 status
    Http {
        status: u16,
        error_code: Option<String>,
        message: String,
        url: String,
        body: Option<serde_json::Value>,
    },

    /// Server answered 200 but flagged the call as not successful
    Api {
        error_code: Option<String>,
        message: String,
        url: String,
        body: Option<serde_json::Value>,
    },

    /// Server answered 200 with a body that cannot be used
    InvalidResponse {
        message: String,
        url: String,
    },

    /// Archive or payload failed its integrity check
    Integrity {
        message: String,
        path: Option<String>,
    },

    /// Configuration errors
    Config {
        message: String,
        field: Option<String>,
    },

    /// Local file I/O errors
    Storage {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Invalid caller input
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The server does not offer the requested capability
    Unsupported {
        message: String,
    },
}

impl ClientError {
    /// Create a new Connection error
    pub fn connection(message: impl Into<String>, url: impl Into<String>) -> Self {
        ClientError::Connection {
            message: message.into(),
            url: url.into(),
        }
    }

    /// Create a new Http error
    pub fn http(status: u16, message: impl Into<String>, url: impl Into<String>) -> Self {
        ClientError::Http {
            status,
            error_code: None,
            message: message.into(),
            url: url.into(),
            body: None,
        }
    }

    /// Create a new Api error (logical failure inside a 200 response)
    pub fn api(message: impl Into<String>, url: impl Into<String>) -> Self {
        ClientError::Api {
            error_code: None,
            message: message.into(),
            url: url.into(),
            body: None,
        }
    }

    /// Create a new InvalidResponse error
    pub fn invalid_response(message: impl Into<String>, url: impl Into<String>) -> Self {
        ClientError::InvalidResponse {
            message: message.into(),
            url: url.into(),
        }
    }

    /// Create a new Integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        ClientError::Integrity {
            message: message.into(),
            path: None,
        }
    }

    /// Create a new Integrity error with path
    pub fn integrity_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        ClientError::Integrity {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        ClientError::Config {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        ClientError::Config {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        ClientError::Storage {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        ClientError::Storage {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Storage error for an io failure on `path`
    pub fn io(err: std::io::Error, path: &Path) -> Self {
        ClientError::storage_error_full(err.to_string(), path.display().to_string(), err.kind().to_string())
    }

    /// Record `path` on storage and integrity errors that have none
    pub fn with_path(mut self, value: &Path) -> Self {
        match &mut self {
            ClientError::Storage { path, .. } | ClientError::Integrity { path, .. } if path.is_none() => {
                *path = Some(value.display().to_string());
            }
            _ => {}
        }
        self
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        ClientError::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        ClientError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new Unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        ClientError::Unsupported {
            message: message.into(),
        }
    }

    /// Attach the server-supplied error code (Http and Api only)
    pub fn with_error_code(mut self, code: Option<String>) -> Self {
        match &mut self {
            ClientError::Http { error_code, .. } | ClientError::Api { error_code, .. } => {
                *error_code = code;
            }
            _ => {}
        }
        self
    }

    /// Attach the decoded response body (Http and Api only)
    pub fn with_body(mut self, value: Option<serde_json::Value>) -> Self {
        match &mut self {
            ClientError::Http { body, .. } | ClientError::Api { body, .. } => {
                *body = value;
            }
            _ => {}
        }
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            ClientError::Connection { message, .. }
            | ClientError::Http { message, .. }
            | ClientError::Api { message, .. }
            | ClientError::InvalidResponse { message, .. }
            | ClientError::Integrity { message, .. } => {
                *message = format!("{}: {}", ctx, message);
            }
            ClientError::Storage { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// HTTP status code carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Api { .. } | ClientError::InvalidResponse { .. } => Some(200),
            _ => None,
        }
    }

    /// Server-supplied error code, if any
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ClientError::Http { error_code, .. } | ClientError::Api { error_code, .. } => error_code.as_deref(),
            _ => None,
        }
    }

    /// Decoded response body, if the server returned JSON
    pub fn body(&self) -> Option<&serde_json::Value> {
        match self {
            ClientError::Http { body, .. } | ClientError::Api { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Connection { message, url } => {
                write!(f, "Connection error on \"{}\": {}", url, message)
            }
            ClientError::Http { status, error_code, message, url, .. } => {
                if let Some(code) = error_code {
                    write!(f, "HTTP {} error on \"{}\": {} (code: {})", status, url, message, code)
                } else {
                    write!(f, "HTTP {} error on \"{}\": {}", status, url, message)
                }
            }
            ClientError::Api { error_code, message, url, .. } => {
                if let Some(code) = error_code {
                    write!(f, "API call failed on \"{}\": {} (code: {})", url, message, code)
                } else {
                    write!(f, "API call failed on \"{}\": {}", url, message)
                }
            }
            ClientError::InvalidResponse { message, url } => {
                write!(f, "Invalid response from \"{}\": {}", url, message)
            }
            ClientError::Integrity { message, path } => {
                if let Some(p) = path {
                    write!(f, "Integrity error: {} (path: {})", message, p)
                } else {
                    write!(f, "Integrity error: {}", message)
                }
            }
            ClientError::Config { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            ClientError::Storage { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            ClientError::Validation { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
            ClientError::Unsupported { message } => write!(f, "Unsupported: {}", message),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Storage {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        ClientError::connection(err.to_string(), url)
    }
}

impl From<zip::result::ZipError> for ClientError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => e.into(),
            other => ClientError::integrity(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(err: tokio::task::JoinError) -> Self {
        ClientError::storage_error(format!("Blocking task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display() {
        let err = ClientError::http(404, "Not found", "https://msc.test/api/v2/medias/get/")
            .with_error_code(Some("not_found".to_string()));
        let text = err.to_string();
        assert!(text.contains("HTTP 404"));
        assert!(text.contains("medias/get"));
        assert!(text.contains("not_found"));
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.error_code(), Some("not_found"));
    }

    #[test]
    fn test_api_error_reports_status_200() {
        let err = ClientError::api("Permission denied", "https://msc.test/api/v2/medias/add/");
        assert_eq!(err.status_code(), Some(200));
        assert!(err.to_string().starts_with("API call failed"));
    }

    #[test]
    fn test_connection_error_has_no_status() {
        let err = ClientError::connection("connection refused", "https://msc.test/");
        assert_eq!(err.status_code(), None);
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_with_body_keeps_json() {
        let err = ClientError::http(400, "Bad offset", "u").with_body(Some(serde_json::json!({"offset": 10})));
        assert_eq!(err.body().and_then(|b| b.get("offset")).and_then(|v| v.as_u64()), Some(10));
    }

    #[test]
    fn test_with_context() {
        let err = ClientError::integrity("bad crc").with_context("while checking backup");
        assert!(err.to_string().contains("while checking backup"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: ClientError = io_err.into();
        assert!(matches!(err, ClientError::Storage { path: None, .. }));

        let err = err.with_path(Path::new("/backups/Talk - v1.zip"));
        assert!(err.to_string().contains("path: /backups/Talk - v1.zip"));
        let err = err.with_path(Path::new("/elsewhere"));
        assert!(!err.to_string().contains("/elsewhere"));
    }

    #[test]
    fn test_io_error_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ClientError::io(io_err, Path::new("/srv/media"));
        match err {
            ClientError::Storage { path, source, .. } => {
                assert_eq!(path.as_deref(), Some("/srv/media"));
                assert_eq!(source.as_deref(), Some("permission denied"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_config_error_with_field() {
        let err = ClientError::config_error_with_field("Invalid value", "SERVER_URL");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("SERVER_URL"));
    }
}
