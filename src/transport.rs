//! The backend exchange seam.
//!
//! Controllers and the fan-out engine speak to storage nodes through
//! [`Transport`], never through a concrete client. Production wires in the
//! HTTP/1.1 implementation; tests inject deterministic fakes that script
//! statuses, etags and timestamps per connection.

use crate::error::TransportError;
use crate::ring::Node;
use crate::timestamp::Timestamp;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

/// How the request body will be delivered to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Sized(u64),
    Chunked,
}

impl BodyKind {
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyKind::None)
    }
}

/// One backend request, node-independent: the engine clones it per
/// connection and the transport prefixes the node's device and partition
/// onto the storage path.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Decoded storage path: `/account[/container[/object]]`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: BodyKind,
}

impl RequestHead {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: BodyKind::None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Status line and headers of a backend response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.header("x-timestamp").and_then(Timestamp::parse)
    }

    /// Etag with any surrounding quotes stripped.
    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(|v| crate::headers::unquote_etag(v).to_string())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

/// An in-flight backend request. Methods are polled with the engine's
/// per-operation deadlines; the transport itself never sleeps.
///
/// Dropping an exchange closes the underlying connection.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Complete the `Expect: 100-continue` handshake. Returns the interim
    /// status: 100 means ready for body; a success status means the backend
    /// answered early (readable later via [`Exchange::read_response`]); 507
    /// and other errors surface as [`TransportError::ExpectRefused`].
    async fn await_continue(&mut self) -> Result<StatusCode, TransportError>;

    /// Write one body chunk.
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError>;

    /// Terminate the request body.
    async fn finish_body(&mut self) -> Result<(), TransportError>;

    /// Read the response status line and headers.
    async fn read_response(&mut self) -> Result<ResponseHead, TransportError>;

    /// Read the next response body chunk; `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Connection factory for one backend exchange.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        node: &Node,
        part: u32,
        head: &RequestHead,
    ) -> Result<Box<dyn Exchange>, TransportError>;
}
