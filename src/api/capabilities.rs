//! Server capability negotiation
//!
//! Every behavior that depends on the server version is derived here, once,
//! from the version string the server advertises. Call sites only look at
//! [`ServerCapabilities`].

use std::fmt;
use std::str::FromStr;

use crate::api::request::Method;
use crate::error::{ClientError, Result};

/// Version assumed for servers that do not advertise one
pub const FALLBACK_VERSION: &str = "6.5.4";

/// Dotted server version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for ServerVersion {
    type Err = ClientError;

    /// Parse `major[.minor[.patch]]`; missing components are 0
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ClientError::validation_error_with_field(format!("Invalid server version \"{}\"", s), "mediaserver");
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in s.trim().split('.') {
            if count == parts.len() {
                // Extra components (build numbers) do not change any capability.
                break;
            }
            parts[count] = piece.parse().map_err(|_| invalid())?;
            count += 1;
        }
        if count == 0 {
            return Err(invalid());
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How the API key travels with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// `api-key` request header
    Header,
    /// `api_key` query parameter (GET/HEAD) or form field (other methods)
    Field,
}

impl AuthMode {
    /// Attach the key to a request's headers, query or form
    pub fn apply(
        &self,
        api_key: &str,
        method: Method,
        headers: &mut Vec<(String, String)>,
        query: &mut Vec<(String, String)>,
        form: &mut Vec<(String, String)>,
    ) {
        match self {
            AuthMode::Header => headers.push(("api-key".to_string(), api_key.to_string())),
            AuthMode::Field if method.uses_query() => query.push(("api_key".to_string(), api_key.to_string())),
            AuthMode::Field => form.push(("api_key".to_string(), api_key.to_string())),
        }
    }
}

/// How the server validates a completed chunked upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// `md5` field with the hex digest of the whole file
    Checksum,
    /// `expected_size` field, with `no_md5=yes`
    ExpectedSize,
}

/// Capabilities derived from the server version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub version: ServerVersion,
    pub auth: AuthMode,
    /// Prefix prepended to the `upload/` endpoints
    pub upload_prefix: &'static str,
    /// Segmented (HLS) uploads are accepted
    pub segmented_upload: bool,
    /// Endpoint serving the metadata archive
    pub metadata_endpoint: &'static str,
    pub completion_check: CompletionCheck,
    /// `catalog/get-all/` only knows `json` and `csv`; older servers take the
    /// requested layout directly
    pub json_catalog: bool,
}

impl ServerCapabilities {
    pub fn from_version(version: ServerVersion) -> Self {
        let modern_upload = version >= ServerVersion::new(8, 2, 0);
        Self {
            version,
            auth: if version.major >= 11 { AuthMode::Header } else { AuthMode::Field },
            upload_prefix: if modern_upload { "" } else { "medias/resource/" },
            segmented_upload: modern_upload,
            metadata_endpoint: if version >= ServerVersion::new(13, 2, 0) {
                "download/metadata/"
            } else {
                "medias/get/zip/"
            },
            completion_check: if version >= ServerVersion::new(11, 3, 1) {
                CompletionCheck::ExpectedSize
            } else {
                CompletionCheck::Checksum
            },
            json_catalog: version >= ServerVersion::new(12, 3, 0),
        }
    }

    /// Capabilities from the `mediaserver` field of the API root response
    pub fn from_root_response(root: &serde_json::Value) -> Result<Self> {
        let version = root
            .get("mediaserver")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .unwrap_or(FALLBACK_VERSION);
        Ok(Self::from_version(version.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_parsing() {
        assert_eq!("13.2.0".parse::<ServerVersion>().unwrap(), ServerVersion::new(13, 2, 0));
        assert_eq!("8.2".parse::<ServerVersion>().unwrap(), ServerVersion::new(8, 2, 0));
        assert_eq!("11.3.1.4".parse::<ServerVersion>().unwrap(), ServerVersion::new(11, 3, 1));
        assert!("abc".parse::<ServerVersion>().is_err());
        assert!("".parse::<ServerVersion>().is_err());
        assert_eq!(ServerVersion::new(6, 5, 4).to_string(), "6.5.4");
    }

    #[test]
    fn test_legacy_server() {
        let caps = ServerCapabilities::from_root_response(&json!({})).unwrap();
        assert_eq!(caps.version, ServerVersion::new(6, 5, 4));
        assert_eq!(caps.auth, AuthMode::Field);
        assert_eq!(caps.upload_prefix, "medias/resource/");
        assert!(!caps.segmented_upload);
        assert_eq!(caps.metadata_endpoint, "medias/get/zip/");
        assert_eq!(caps.completion_check, CompletionCheck::Checksum);
        assert!(!caps.json_catalog);
    }

    #[test]
    fn test_boundaries() {
        let caps = ServerCapabilities::from_version(ServerVersion::new(8, 2, 0));
        assert!(caps.segmented_upload);
        assert_eq!(caps.upload_prefix, "");
        assert_eq!(caps.auth, AuthMode::Field);

        let caps = ServerCapabilities::from_version(ServerVersion::new(11, 3, 0));
        assert_eq!(caps.auth, AuthMode::Header);
        assert_eq!(caps.completion_check, CompletionCheck::Checksum);

        let caps = ServerCapabilities::from_version(ServerVersion::new(11, 3, 1));
        assert_eq!(caps.completion_check, CompletionCheck::ExpectedSize);
        assert_eq!(caps.metadata_endpoint, "medias/get/zip/");
        assert!(!caps.json_catalog);

        assert!(ServerCapabilities::from_version(ServerVersion::new(12, 3, 0)).json_catalog);

        let caps = ServerCapabilities::from_root_response(&json!({"mediaserver": "13.2.0"})).unwrap();
        assert_eq!(caps.metadata_endpoint, "download/metadata/");
    }

    #[test]
    fn test_auth_mode_placement() {
        let (mut headers, mut query, mut form) = (Vec::new(), Vec::new(), Vec::new());
        AuthMode::Field.apply("k", Method::Head, &mut headers, &mut query, &mut form);
        AuthMode::Field.apply("k", Method::Post, &mut headers, &mut query, &mut form);
        AuthMode::Header.apply("k", Method::Get, &mut headers, &mut query, &mut form);
        assert_eq!(query, vec![("api_key".to_string(), "k".to_string())]);
        assert_eq!(form, vec![("api_key".to_string(), "k".to_string())]);
        assert_eq!(headers, vec![("api-key".to_string(), "k".to_string())]);
    }
}
