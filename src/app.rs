//! The application layer: path parsing, method dispatch, request plumbing.
//!
//! One [`Application`] value owns every collaborator (rings, limiters, cache,
//! fan-out engine); there is no module-level state. The hyper service is a
//! thin closure over [`Application::handle`], which is generic over the body
//! type so tests can drive it with buffered requests.

use crate::cache::{CacheBackend, LookupCache, MemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::config::ProxyConfig;
use crate::controllers::{self, text_response, Authorizer, ClientRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::error_limit::ErrorLimiter;
use crate::node_iter::NodeIterator;
use crate::replicate::{BodyError, BodySource, Replicator, ReplicatorConfig};
use crate::ring::Ring;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timestamp::TimestampIssuer;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderValue, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// The three placement rings the proxy consumes.
pub struct Rings {
    pub account: Arc<Ring>,
    pub container: Arc<Ring>,
    pub object: Arc<Ring>,
}

pub struct Application {
    pub config: ProxyConfig,
    pub account_ring: Arc<Ring>,
    pub container_ring: Arc<Ring>,
    pub object_ring: Arc<Ring>,
    pub account_limiter: Arc<ErrorLimiter>,
    pub container_limiter: Arc<ErrorLimiter>,
    pub object_limiter: Arc<ErrorLimiter>,
    pub cache: LookupCache,
    pub replicator: Replicator,
    pub issuer: TimestampIssuer,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

pub struct ApplicationBuilder {
    config: ProxyConfig,
    rings: Rings,
    transport: Arc<dyn Transport>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl ApplicationBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn build(self) -> Application {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let backend = self
            .cache_backend
            .unwrap_or_else(|| Arc::new(MemoryCache::new(clock.clone())));
        let config = self.config;
        let limiter = |clock: &Arc<dyn Clock>| {
            Arc::new(ErrorLimiter::new(
                config.error_suppression_limit,
                config.error_suppression_interval,
                clock.clone(),
            ))
        };
        let replicator = Replicator::new(
            self.transport,
            ReplicatorConfig {
                connect_timeout: config.connect_timeout(),
                node_timeout: config.node_timeout(),
                abort_on_disk_full: config.abort_on_disk_full,
            },
        );
        Application {
            account_limiter: limiter(&clock),
            container_limiter: limiter(&clock),
            object_limiter: limiter(&clock),
            cache: LookupCache::new(backend, sleeper.clone()),
            replicator,
            issuer: TimestampIssuer::new(clock.clone()),
            account_ring: self.rings.account,
            container_ring: self.rings.container,
            object_ring: self.rings.object,
            clock,
            sleeper,
            authorizer: self.authorizer,
            config,
        }
    }
}

/// Where a parsed path points.
enum Target {
    Account,
    Container(String),
    Object(String, String),
}

enum Parsed {
    Ok { account: String, target: Target },
    /// `/` and paths with empty required segments.
    NotFound,
    /// Unknown API version, missing account, or undecodable UTF-8.
    PreconditionFailed(&'static str),
}

impl Application {
    pub fn builder(
        config: ProxyConfig,
        rings: Rings,
        transport: Arc<dyn Transport>,
    ) -> ApplicationBuilder {
        ApplicationBuilder {
            config,
            rings,
            transport,
            clock: None,
            sleeper: None,
            cache_backend: None,
            authorizer: None,
        }
    }

    pub fn account_iter(&self, account: &str) -> (u32, NodeIterator) {
        let part = self.account_ring.partition(account, None, None);
        (part, self.iter_for(&self.account_ring, &self.account_limiter, part))
    }

    pub fn container_iter(&self, account: &str, container: &str) -> (u32, NodeIterator) {
        let part = self.container_ring.partition(account, Some(container), None);
        (part, self.iter_for(&self.container_ring, &self.container_limiter, part))
    }

    pub fn object_iter(&self, account: &str, container: &str, object: &str) -> (u32, NodeIterator) {
        let part = self.object_ring.partition(account, Some(container), Some(object));
        (part, self.iter_for(&self.object_ring, &self.object_limiter, part))
    }

    fn iter_for(&self, ring: &Arc<Ring>, limiter: &Arc<ErrorLimiter>, part: u32) -> NodeIterator {
        let max_handoffs = self.config.max_handoffs.unwrap_or_else(|| ring.replica_count());
        NodeIterator::new(
            ring.clone(),
            part,
            limiter.clone(),
            max_handoffs,
            self.config.log_handoffs,
        )
    }

    /// Handle one client request end to end.
    pub async fn handle<B>(&self, req: Request<B>) -> ProxyResponse
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let trans_id = format!("tx{}", Uuid::new_v4().simple());

        if let Some(resp) = self.check_denied_host(&req, &trans_id) {
            return resp;
        }
        if let Some(resp) = self.check_content_length(&req, &trans_id) {
            return resp;
        }

        let span = tracing::info_span!("request", trans_id = %trans_id);
        let dispatch =
            std::panic::AssertUnwindSafe(self.dispatch(req, trans_id.clone()).instrument(span));
        let mut response = match dispatch.catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                if err.is_client_disconnect() {
                    tracing::info!("client disconnected mid-request");
                } else {
                    tracing::warn!(error = %err, "request failed");
                }
                text_response(err.status(), &trans_id, &err.to_string())
            }
            Err(_) => {
                tracing::error!("handler panicked");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &trans_id,
                    "Internal server error",
                )
            }
        };
        if !response.headers().contains_key("x-trans-id") {
            if let Ok(value) = HeaderValue::from_str(&trans_id) {
                response.headers_mut().insert("x-trans-id", value);
            }
        }
        response
    }

    async fn dispatch<B>(
        &self,
        req: Request<B>,
        trans_id: String,
    ) -> Result<ProxyResponse, ProxyError>
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let (account, target) = match parse_path(req.uri().path()) {
            Parsed::Ok { account, target } => (account, target),
            Parsed::NotFound => return Ok(text_response(StatusCode::NOT_FOUND, &trans_id, "Not Found")),
            Parsed::PreconditionFailed(reason) => {
                return Ok(text_response(StatusCode::PRECONDITION_FAILED, &trans_id, reason))
            }
        };

        let allowed: &[&str] = match target {
            Target::Object(..) => &["GET", "HEAD", "PUT", "POST", "DELETE", "COPY"],
            _ => &["GET", "HEAD", "PUT", "POST", "DELETE"],
        };
        if !allowed.contains(&req.method().as_str()) {
            return Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &trans_id,
                "Method Not Allowed",
            ));
        }

        let authorizer = req
            .extensions()
            .get::<Arc<dyn Authorizer>>()
            .cloned()
            .or_else(|| self.authorizer.clone());
        let method = req.method().clone();
        let headers = req.headers().clone();
        let query = req.uri().query().map(str::to_string);
        let body = ClientBody { inner: req.into_body(), timeout: self.config.client_timeout() };

        let (container, object) = match target {
            Target::Account => (None, None),
            Target::Container(c) => (Some(c), None),
            Target::Object(c, o) => (Some(c), Some(o)),
        };
        let client_req = ClientRequest {
            method,
            account,
            container,
            object,
            headers,
            query,
            trans_id,
            body: Box::new(body),
            authorizer,
        };

        match (&client_req.container, &client_req.object) {
            (Some(_), Some(_)) => controllers::object::handle(self, client_req).await,
            (Some(_), None) => controllers::container::handle(self, client_req).await,
            _ => controllers::account::handle(self, client_req).await,
        }
    }

    fn check_denied_host<B>(&self, req: &Request<B>, trans_id: &str) -> Option<ProxyResponse> {
        if self.config.deny_host_headers.is_empty() {
            return None;
        }
        let host = req.headers().get("host").and_then(|v| v.to_str().ok())?;
        let denied = self
            .config
            .deny_host_headers
            .iter()
            .any(|deny| deny.eq_ignore_ascii_case(host));
        if denied {
            tracing::warn!(host = %host, "denied host header");
            return Some(text_response(StatusCode::FORBIDDEN, trans_id, "Forbidden"));
        }
        None
    }

    fn check_content_length<B>(&self, req: &Request<B>, trans_id: &str) -> Option<ProxyResponse> {
        let raw = req.headers().get("content-length")?.to_str().ok()?;
        match raw.trim().parse::<i64>() {
            Ok(n) if n >= 0 => None,
            _ => Some(text_response(
                StatusCode::BAD_REQUEST,
                trans_id,
                "Invalid Content-Length",
            )),
        }
    }
}

/// Client request body with the per-read client timeout applied.
struct ClientBody<B> {
    inner: B,
    timeout: Duration,
}

#[async_trait]
impl<B> BodySource for ClientBody<B>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + Unpin + 'static,
    B::Error: std::fmt::Display + Send,
{
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        loop {
            let frame = tokio::time::timeout(self.timeout, self.inner.frame())
                .await
                .map_err(|_| BodyError::Timeout(self.timeout))?;
            match frame {
                None => return Ok(None),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                    // Trailers are ignored.
                }
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "client body read failed");
                    return Err(BodyError::Disconnect);
                }
            }
        }
    }
}

fn parse_path(raw: &str) -> Parsed {
    let decoded = match percent_encoding::percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => return Parsed::PreconditionFailed("Invalid UTF8"),
    };
    let Some(rest) = decoded.strip_prefix('/') else {
        return Parsed::NotFound;
    };
    if rest.is_empty() {
        return Parsed::NotFound;
    }
    let mut parts = rest.splitn(4, '/');
    let version = parts.next().unwrap_or("");
    if version != "v1" && version != "v1.0" {
        return Parsed::PreconditionFailed("Bad URL");
    }
    let Some(account) = parts.next().filter(|a| !a.is_empty()) else {
        return Parsed::PreconditionFailed("Bad URL");
    };
    let container = parts.next();
    let object = parts.next().filter(|o| !o.is_empty());
    match (container, object) {
        (None, _) | (Some(""), None) => {
            Parsed::Ok { account: account.to_string(), target: Target::Account }
        }
        (Some(""), Some(_)) => Parsed::NotFound,
        (Some(container), None) => Parsed::Ok {
            account: account.to_string(),
            target: Target::Container(container.to_string()),
        },
        (Some(container), Some(object)) => Parsed::Ok {
            account: account.to_string(),
            target: Target::Object(container.to_string(), object.to_string()),
        },
    }
}

/// Accept loop: one task per connection, HTTP/1.1 with streamed bodies.
pub async fn serve(
    app: Arc<Application>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let app = app.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(app.handle(req).await)
                }
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service);
            if let Err(err) = conn.await {
                tracing::debug!(peer = %peer, error = %err, "connection closed with error");
            }
        });
    }
}
