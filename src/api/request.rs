//! API request description
//!
//! [`ApiRequest`] is what callers build; [`PreparedRequest`] is the fully
//! resolved form (absolute URL, credentials, file contents) handed to a
//! [`Transport`](crate::api::Transport).

use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ClientError, Result};

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Method name as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether parameters travel in the query string rather than the body
    pub fn uses_query(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl std::str::FromStr for Method {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(ClientError::validation_error_with_field(
                format!("Unsupported method \"{}\"", other),
                "method",
            )),
        }
    }
}

/// A rewindable upload source
///
/// Anything readable and seekable qualifies. Sources must start at offset 0;
/// the retry loop seeks them back to 0 before every new attempt.
pub trait UploadSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> UploadSource for T {}

enum PartContent {
    Bytes(Bytes),
    Source(Box<dyn UploadSource>),
}

/// One multipart file field
pub struct FilePart {
    field: String,
    file_name: String,
    content: PartContent,
}

impl FilePart {
    /// File part backed by in-memory bytes
    pub fn from_bytes(field: impl Into<String>, file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content: PartContent::Bytes(data.into()),
        }
    }

    /// File part backed by a seekable source
    ///
    /// Fails if the source is not positioned at offset 0: resuming a part
    /// from the middle is not supported.
    pub fn from_source(
        field: impl Into<String>,
        file_name: impl Into<String>,
        mut source: impl UploadSource + 'static,
    ) -> Result<Self> {
        let file_name = file_name.into();
        let position = source.stream_position()?;
        if position != 0 {
            return Err(ClientError::validation_error_with_field(
                format!("Upload source \"{}\" starts at offset {}, only 0 is supported", file_name, position),
                "files",
            ));
        }
        Ok(Self {
            field: field.into(),
            file_name,
            content: PartContent::Source(Box::new(source)),
        })
    }

    /// Form field name
    pub fn field(&self) -> &str {
        &self.field
    }

    /// File name sent with the part
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Seek a source-backed part back to its start
    pub fn rewind(&mut self) -> Result<()> {
        if let PartContent::Source(source) = &mut self.content {
            source.seek(SeekFrom::Start(0))?;
        }
        Ok(())
    }

    /// Read the part content from the current position
    pub(crate) fn read_content(&mut self) -> Result<Bytes> {
        match &mut self.content {
            PartContent::Bytes(data) => Ok(data.clone()),
            PartContent::Source(source) => {
                let mut buf = Vec::new();
                source.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl fmt::Debug for FilePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.content {
            PartContent::Bytes(data) => format!("bytes({})", data.len()),
            PartContent::Source(_) => "source".to_string(),
        };
        f.debug_struct("FilePart")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("content", &kind)
            .finish()
    }
}

/// A call to the API, before credentials and URL resolution
#[derive(Debug)]
pub struct ApiRequest {
    pub uri: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub data: Vec<(String, String)>,
    pub files: Vec<FilePart>,
    /// Decode the body as JSON (otherwise return text)
    pub parse_json: bool,
    /// Return the raw response for streaming on success
    pub stream: bool,
    pub timeout: Option<Duration>,
    /// Attach the API key
    pub authenticate: bool,
    /// Override the configured retry count
    pub max_retry: Option<u32>,
}

impl ApiRequest {
    /// Create a new request
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method,
            headers: Vec::new(),
            params: Vec::new(),
            data: Vec::new(),
            files: Vec::new(),
            parse_json: true,
            stream: false,
            timeout: None,
            authenticate: true,
            max_retry: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::Get, uri)
    }

    pub fn head(uri: impl Into<String>) -> Self {
        Self::new(Method::Head, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::Post, uri)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    /// Return the body as text instead of decoding JSON
    pub fn text(mut self) -> Self {
        self.parse_json = false;
        self
    }

    /// Return the raw response on success so the body can be streamed
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Do not attach the API key (pre-signed URLs, version probe)
    pub fn unauthenticated(mut self) -> Self {
        self.authenticate = false;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Rewind every source-backed file part
    pub fn rewind_files(&mut self) -> Result<()> {
        for part in &mut self.files {
            part.rewind()?;
        }
        Ok(())
    }
}

/// File content ready to be sent
#[derive(Debug, Clone)]
pub struct PreparedFile {
    pub field: String,
    pub file_name: String,
    pub data: Bytes,
}

/// A fully resolved request, as seen by the transport
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub files: Vec<PreparedFile>,
    pub timeout: Duration,
    pub stream: bool,
}

impl PreparedRequest {
    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_pair(&self.headers, name, true)
    }

    /// First query parameter value with the given name
    pub fn query_value(&self, name: &str) -> Option<&str> {
        find_pair(&self.query, name, false)
    }

    /// First form field value with the given name
    pub fn form_value(&self, name: &str) -> Option<&str> {
        find_pair(&self.form, name, false)
    }
}

fn find_pair<'a>(pairs: &'a [(String, String)], name: &str, ignore_case: bool) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| if ignore_case { k.eq_ignore_ascii_case(name) } else { k == name })
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_source_must_start_at_zero() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        cursor.set_position(3);
        let err = FilePart::from_source("file", "a.txt", cursor).unwrap_err();
        assert!(matches!(err, ClientError::Validation { .. }));
    }

    #[test]
    fn test_rewind_rereads_full_content() {
        let cursor = Cursor::new(b"hello world".to_vec());
        let mut part = FilePart::from_source("file", "a.txt", cursor).unwrap();
        assert_eq!(part.read_content().unwrap(), Bytes::from_static(b"hello world"));
        // Consumed: a second read without rewinding yields nothing.
        assert!(part.read_content().unwrap().is_empty());
        part.rewind().unwrap();
        assert_eq!(part.read_content().unwrap(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert!(Method::Head.uses_query());
        assert!(!Method::Post.uses_query());
        assert!("PATCH".parse::<Method>().is_err());
    }

    #[test]
    fn test_builder() {
        let req = ApiRequest::post("upload/")
            .field("upload_id", "abc")
            .header("Content-Range", "bytes 0-9/10")
            .max_retry(2)
            .unauthenticated();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.data, vec![("upload_id".to_string(), "abc".to_string())]);
        assert_eq!(req.max_retry, Some(2));
        assert!(!req.authenticate);
    }
}
