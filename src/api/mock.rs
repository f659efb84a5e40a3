//! Scripted transport for tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::api::request::{Method, PreparedRequest};
use crate::api::retry::RetryPolicy;
use crate::api::transport::{RawResponse, Transport};
use crate::client::MediaServerClient;
use crate::config::ClientConfig;
use crate::error::Result;

type Handler = Box<dyn FnMut(&PreparedRequest) -> Result<RawResponse> + Send>;

/// Transport answering every request with a closure and recording it
pub struct MockTransport {
    handler: Mutex<Handler>,
    log: Mutex<Vec<PreparedRequest>>,
}

impl MockTransport {
    pub fn new(handler: impl FnMut(&PreparedRequest) -> Result<RawResponse> + Send + 'static) -> Self {
        Self {
            handler: Mutex::new(Box::new(handler)),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<PreparedRequest> {
        self.log.lock().unwrap().clone()
    }

    /// Requests whose URL contains `fragment` and that used `method`
    pub fn count(&self, method: Method, fragment: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse> {
        self.log.lock().unwrap().push(request.clone());
        let mut handler = self.handler.lock().unwrap();
        (handler)(&request)
    }
}

pub fn json_response(status: u16, body: Value) -> RawResponse {
    RawResponse::buffered(status, body.to_string()).with_header("Content-Type", "application/json")
}

/// Answer to the version probe (`GET /api/v2/`)
pub fn version_response(version: &str) -> RawResponse {
    json_response(200, json!({"mediaserver": version}))
}

/// Whether a request is the unauthenticated version probe
pub fn is_version_probe(req: &PreparedRequest) -> bool {
    req.method == Method::Get && req.url.ends_with("/api/v2/") && req.header("api-key").is_none()
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        server_url: "https://msc.test".to_string(),
        api_key: "the-key".to_string(),
        client_id: "test-client".to_string(),
        use_session: false,
        ..ClientConfig::default()
    }
}

/// Client over a mock transport, with retries sleeping for zero time
pub fn test_client(config: ClientConfig, transport: Arc<MockTransport>) -> MediaServerClient {
    let policy = RetryPolicy::from_config(&config).with_backoff_unit(Duration::ZERO);
    MediaServerClient::with_transport(config, transport)
        .expect("valid test configuration")
        .with_retry_policy(policy)
}
