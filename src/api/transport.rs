//! Transport abstraction
//!
//! The executor never talks to the network directly: it hands a
//! [`PreparedRequest`] to a [`Transport`] and gets back a [`RawResponse`].
//! [`ReqwestTransport`] is the production implementation; tests plug in a
//! scripted one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::api::request::{Method, PreparedRequest};
use crate::config::{ClientConfig, ProxySettings};
use crate::error::{ClientError, Result};

/// Stream of body chunks
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Response body, either fully read or still on the wire
pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

/// Response as returned by a transport
pub struct RawResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: ResponseBody,
}

impl RawResponse {
    /// Create a new response; header names are normalized to lower case
    pub fn new(status: u16, headers: HashMap<String, String>, body: ResponseBody) -> Self {
        let headers = headers.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
        Self { status, headers, body }
    }

    /// Response with an in-memory body and no headers
    pub fn buffered(status: u16, body: impl Into<Bytes>) -> Self {
        Self::new(status, HashMap::new(), ResponseBody::Buffered(body.into()))
    }

    /// Add a header
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Value of `Content-Length`, if present and numeric
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Read the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Buffered(data) => Ok(data),
            ResponseBody::Streaming(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }

    /// Read the whole body as text (invalid UTF-8 is replaced)
    pub async fn text(self) -> Result<String> {
        let data = self.bytes().await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Body as a chunk stream
    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Buffered(data) => stream::once(async move { Ok(data) }).boxed(),
            ResponseBody::Streaming(stream) => stream,
        }
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Wrap a body stream so that each chunk must arrive within `timeout`
///
/// The stream ends after its first error.
pub fn with_read_timeout<E>(
    inner: BoxStream<'static, std::result::Result<Bytes, E>>,
    timeout: Duration,
    url: String,
) -> ByteStream
where
    E: std::fmt::Display + Send + 'static,
{
    stream::unfold(Some(inner), move |state| {
        let url = url.clone();
        async move {
            let mut inner = state?;
            match tokio::time::timeout(timeout, inner.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
                Ok(Some(Err(e))) => Some((Err(ClientError::connection(e.to_string(), url)), None)),
                Ok(None) => None,
                Err(_) => {
                    let message = format!("No data received for {} s", timeout.as_secs_f64());
                    Some((Err(ClientError::connection(message, url)), None))
                }
            }
        }
    })
    .boxed()
}

/// Network seam used by the executor
///
/// Implementations perform exactly one request and never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the server's response, whatever its status
    ///
    /// Errors are connection-level failures only.
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse>;
}

/// Settings the reqwest transport needs from the configuration
#[derive(Debug, Clone)]
struct TransportSettings {
    use_session: bool,
    verify_ssl: bool,
    proxies: Option<ProxySettings>,
}

/// Production transport based on `reqwest`
///
/// With `use_session` the underlying `reqwest::Client` is created on first
/// use and shared by every later request; it is safe for concurrent use.
/// Without it a fresh client is built per request.
pub struct ReqwestTransport {
    settings: TransportSettings,
    session: OnceCell<reqwest::Client>,
}

impl ReqwestTransport {
    /// Create a new transport from the client configuration
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            settings: TransportSettings {
                use_session: config.use_session,
                verify_ssl: config.verify_ssl,
                proxies: config.proxies.clone(),
            },
            session: OnceCell::new(),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(!self.settings.verify_ssl)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxies) = &self.settings.proxies {
            builder = builder.no_proxy();
            if let Some(http) = proxies.http.as_deref().filter(|p| !p.is_empty()) {
                builder = builder.proxy(reqwest::Proxy::http(http)?);
            }
            if let Some(https) = proxies.https.as_deref().filter(|p| !p.is_empty()) {
                builder = builder.proxy(reqwest::Proxy::https(https)?);
            }
        }

        Ok(builder.build()?)
    }

    async fn client(&self) -> Result<reqwest::Client> {
        if !self.settings.use_session {
            return self.build_client();
        }
        let client = self
            .session
            .get_or_try_init(|| async {
                debug!("Creating persistent HTTP session");
                self.build_client()
            })
            .await?;
        Ok(client.clone())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<RawResponse> {
        let client = self.client().await?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        // A streamed body may take longer than the timeout as a whole; only
        // the wait for the headers and for each chunk is bounded.
        let mut builder = client.request(method, &request.url);
        if !request.stream {
            builder = builder.timeout(request.timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if !request.files.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in request.form {
                form = form.text(name, value);
            }
            for file in request.files {
                let part = reqwest::multipart::Part::stream(file.data).file_name(file.file_name);
                form = form.part(file.field, part);
            }
            builder = builder.multipart(form);
        } else if !request.form.is_empty() {
            builder = builder.form(&request.form);
        }

        let url = request.url.clone();
        let response = if request.stream {
            tokio::time::timeout(request.timeout, builder.send())
                .await
                .map_err(|_| ClientError::connection("No response received before the timeout", url.clone()))?
        } else {
            builder.send().await
        }
        .map_err(|e| ClientError::connection(e.to_string(), url.clone()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let body = if request.stream {
            ResponseBody::Streaming(with_read_timeout(response.bytes_stream().boxed(), request.timeout, url))
        } else {
            let data = response
                .bytes()
                .await
                .map_err(|e| ClientError::connection(e.to_string(), request.url.clone()))?;
            ResponseBody::Buffered(data)
        };

        Ok(RawResponse::new(status, headers, body))
    }
}
