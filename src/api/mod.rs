//! API access layer
//!
//! Requests are described by [`ApiRequest`], prepared and sent once by the
//! [`Executor`] over a [`Transport`], and retried according to a
//! [`RetryPolicy`].

pub mod capabilities;
pub mod executor;
pub mod request;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use capabilities::{AuthMode, CompletionCheck, ServerCapabilities, ServerVersion};
pub use executor::{ApiResponse, Executor};
pub use request::{ApiRequest, FilePart, Method, PreparedFile, PreparedRequest, UploadSource};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{ByteStream, RawResponse, ReqwestTransport, ResponseBody, Transport};
