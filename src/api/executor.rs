//! Authenticated request executor
//!
//! Performs exactly one HTTP call and turns the outcome into either an
//! [`ApiResponse`] or a single [`ClientError`]. Retrying is not done here.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::api::capabilities::AuthMode;
use crate::api::request::{ApiRequest, Method, PreparedFile, PreparedRequest};
use crate::api::transport::{RawResponse, Transport};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Length of the raw body excerpt used when no error message is found
const ERROR_EXCERPT_CHARS: usize = 200;

/// Successful result of an API call
#[derive(Debug)]
pub enum ApiResponse {
    /// Decoded JSON body
    Json(Value),
    /// Body returned as text
    Text(String),
    /// Unread response (streaming and HEAD requests)
    Raw(RawResponse),
}

impl ApiResponse {
    pub fn into_json(self) -> Result<Value> {
        match self {
            ApiResponse::Json(value) => Ok(value),
            other => Err(ClientError::invalid_response(
                format!("Expected a JSON response, got {}", other.kind()),
                "",
            )),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            ApiResponse::Text(text) => Ok(text),
            ApiResponse::Json(value) => Ok(value.to_string()),
            ApiResponse::Raw(_) => Err(ClientError::invalid_response("Expected a text response, got a raw one", "")),
        }
    }

    pub fn into_raw(self) -> Result<RawResponse> {
        match self {
            ApiResponse::Raw(raw) => Ok(raw),
            other => Err(ClientError::invalid_response(
                format!("Expected a raw response, got {}", other.kind()),
                "",
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiResponse::Json(_) => "JSON",
            ApiResponse::Text(_) => "text",
            ApiResponse::Raw(_) => "raw",
        }
    }
}

/// Executes single API calls against the configured server
#[derive(Clone)]
pub struct Executor {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(config: Arc<ClientConfig>, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Expand a relative URI to `{server_url}/api/v2/{uri}/`; full URLs are kept
    pub fn resolve_url(&self, uri: &str) -> String {
        if uri.contains("://") {
            return uri.to_string();
        }
        let path = format!("{}/", uri.trim_end_matches('/'));
        format!("{}/api/v2/{}", self.config.server_url, path.trim_start_matches('/'))
    }

    /// Build the wire form of a request
    ///
    /// Source-backed file parts are read from their current position.
    pub fn prepare(&self, req: &mut ApiRequest, auth: Option<AuthMode>) -> Result<PreparedRequest> {
        let mut headers = req.headers.clone();
        let mut query = req.params.clone();
        let mut form = req.data.clone();

        if let Some(language) = &self.config.language {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("accept-language")) {
                headers.push(("Accept-Language".to_string(), language.clone()));
            }
        }
        if req.authenticate && !self.config.api_key.is_empty() {
            if let Some(mode) = auth {
                mode.apply(&self.config.api_key, req.method, &mut headers, &mut query, &mut form);
            }
        }

        let mut files = Vec::with_capacity(req.files.len());
        for part in &mut req.files {
            files.push(PreparedFile {
                field: part.field().to_string(),
                file_name: part.file_name().to_string(),
                data: part.read_content()?,
            });
        }

        Ok(PreparedRequest {
            method: req.method,
            url: self.resolve_url(&req.uri),
            headers,
            query,
            form,
            files,
            timeout: req.timeout.unwrap_or(self.config.timeout),
            stream: req.stream,
        })
    }

    /// Perform one call
    pub async fn execute(&self, req: &mut ApiRequest, auth: Option<AuthMode>) -> Result<ApiResponse> {
        let begin = Instant::now();
        let prepared = self.prepare(req, auth)?;
        let url = prepared.url.clone();
        debug!("{} {}", prepared.method.as_str(), url);

        let response = self.transport.send(prepared).await?;
        let result = normalize(response, req.method, req.parse_json, req.stream, &url).await;
        debug!("API call duration: {:.2} s - {}", begin.elapsed().as_secs_f64(), req.uri);
        result
    }
}

async fn normalize(
    response: RawResponse,
    method: Method,
    parse_json: bool,
    stream: bool,
    url: &str,
) -> Result<ApiResponse> {
    let status = response.status();
    if status == 200 {
        if stream || method == Method::Head {
            return Ok(ApiResponse::Raw(response));
        }
        if !parse_json {
            return Ok(ApiResponse::Text(response.text().await?));
        }
    }

    let text = response.text().await?;
    let body = if parse_json {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Some(value),
            Err(e) if status == 200 => {
                return Err(ClientError::invalid_response(format!("Failed to decode JSON: {}", e), url));
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let unsuccessful = body
        .as_ref()
        .and_then(|b| b.get("success"))
        .and_then(Value::as_bool)
        .is_some_and(|success| !success);
    if status == 200 && !unsuccessful {
        return Ok(ApiResponse::Json(body.unwrap_or(Value::Null)));
    }

    let message = body.as_ref().and_then(error_message).unwrap_or_else(|| excerpt(&text));
    let code = body.as_ref().and_then(error_code);
    let err = if status == 200 {
        ClientError::api(message, url)
    } else {
        ClientError::http(status, message, url)
    };
    Err(err.with_error_code(code).with_body(body))
}

fn error_message(body: &Value) -> Option<String> {
    ["error", "errors", "message"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
}

fn error_code(body: &Value) -> Option<String> {
    match body.get("code")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_EXCERPT_CHARS).collect()
}
