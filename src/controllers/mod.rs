//! Per-resource verb handlers.
//!
//! Controllers own the translation from a parsed client request to replicated
//! backend dispatches. They share one shape: validate, authorize, consult the
//! lookup cache, fan out, translate the winning response.

pub mod account;
pub mod base;
pub mod container;
pub mod object;

use crate::error::ProxyError;
use crate::replicate::BodySource;
use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Frame;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Response body type used across the proxy: either a buffered payload or a
/// live backend stream.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

pub type ProxyResponse = Response<ProxyBody>;

/// A parsed client request, ready for a controller.
pub struct ClientRequest {
    pub method: Method,
    pub account: String,
    pub container: Option<String>,
    pub object: Option<String>,
    pub headers: HeaderMap,
    /// Raw query string, passed through to backend listings verbatim.
    pub query: Option<String>,
    pub trans_id: String,
    pub body: Box<dyn BodySource>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl ClientRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Storage path: `/account[/container[/object]]`.
    pub fn storage_path(&self) -> String {
        let mut path = format!("/{}", self.account);
        if let Some(container) = &self.container {
            path.push('/');
            path.push_str(container);
            if let Some(object) = &self.object {
                path.push('/');
                path.push_str(object);
            }
        }
        path
    }

    pub fn wants_newest(&self) -> bool {
        self.header("x-newest").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }
}

/// Context handed to the authorization hook.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub method: &'a Method,
    pub account: &'a str,
    pub container: Option<&'a str>,
    pub object: Option<&'a str>,
    pub referer: Option<&'a str>,
    /// The applicable container ACL, when one is known.
    pub acl: Option<&'a str>,
}

/// Denial returned by the authorization hook; `None` means allowed.
#[derive(Debug, Clone)]
pub struct AuthDenial {
    pub status: StatusCode,
    pub message: String,
}

/// Authorization hook supplied by the deployment (auth middleware) or by
/// tests. Any denial short-circuits the request.
pub trait Authorizer: Send + Sync + std::fmt::Debug {
    fn authorize(&self, ctx: &AuthContext<'_>) -> Option<AuthDenial>;
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Body fed by a driver task over a small bounded channel. The channel keeps
/// backpressure intact (the driver pauses while the client is slow) and the
/// receiver side is freely shareable where exchange objects are not. A
/// dropped response cancels the driver through the closed channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes, ProxyError>>,
}

impl http_body::Body for ChannelBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Create a channel-fed body plus the sender its driver writes into.
pub fn channel_body() -> (mpsc::Sender<Result<Bytes, ProxyError>>, ProxyBody) {
    let (tx, rx) = mpsc::channel(2);
    (tx, ChannelBody { rx }.boxed())
}

pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Small plain-text response with an exact `Content-Length`.
pub fn text_response(status: StatusCode, trans_id: &str, message: &str) -> ProxyResponse {
    let body = Bytes::from(message.to_string());
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .header("content-length", body.len())
        .header("x-trans-id", trans_id);
    if status == StatusCode::METHOD_NOT_ALLOWED {
        builder = builder.header("allow", "GET, HEAD, PUT, POST, DELETE");
    }
    builder.body(full_body(body)).unwrap_or_else(|_| {
        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}
