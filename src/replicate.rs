//! Replicated fan-out engine.
//!
//! Three dispatch shapes cover every proxy verb:
//! - [`Replicator::make_requests`]: header-only fan-out for mutations against
//!   account/container rings and object POST/DELETE. Failed connects are
//!   replaced from the node iterator; all responses are collected and judged
//!   by [`best_response`].
//! - [`Replicator::read`]: GET/HEAD. Nodes are walked one at a time and the
//!   first streamable response wins; `X-Newest` switches to an all-nodes race
//!   decided by backend timestamp.
//! - [`Replicator::stream_put`]: object writes. Connections must pass the
//!   `Expect: 100-continue` gate to join the write set; body chunks go to
//!   every live writer before the next chunk is read from the client, and the
//!   request fails the moment the live set drops below quorum.

use crate::error::{ProxyError, TransportError};
use crate::error_limit::ErrorLimiter;
use crate::node_iter::NodeIterator;
use crate::ring::Node;
use crate::transport::{Exchange, RequestHead, ResponseHead, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use http::{HeaderMap, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Client bodies are pumped in pieces no larger than this.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Cap on buffered response bodies (error pages, listings).
const BUFFERED_BODY_MAX: usize = 16 * 1024 * 1024;

/// Cap on bodies kept from non-winning responses.
const ERROR_BODY_MAX: usize = 64 * 1024;

/// How long to wait for a straggling response from a writer that failed
/// mid-body, to tell disk-full apart from a garden-variety broken pipe.
const WRITE_FAILURE_PROBE: Duration = Duration::from_millis(250);

/// One backend's complete answer.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub node: Node,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The response selected to represent the replica set.
#[derive(Debug, Clone)]
pub struct BestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub etag: Option<String>,
}

/// A winning read: headers plus the open exchange to stream the body from.
pub struct StreamingResponse {
    pub node: Node,
    pub head: ResponseHead,
    pub exchange: Box<dyn Exchange>,
}

/// Outcome of a replicated read.
pub enum ReadOutcome {
    Stream(StreamingResponse),
    Error(BestResponse),
}

/// Where the client body comes from: the HTTP server adapter in production,
/// a backend GET stream for server-side copies, a buffer in tests.
#[async_trait]
pub trait BodySource: Send + Sync {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError>;
}

#[derive(Debug)]
pub enum BodyError {
    /// Nothing arrived from the client within `client_timeout`.
    Timeout(Duration),
    /// The client connection died.
    Disconnect,
    /// An internal body source (server-side copy, manifest assembly) failed.
    Source(String),
}

/// A fully buffered body source, used by internal copies and tests.
pub struct BufferedBody {
    remaining: Option<Bytes>,
}

impl BufferedBody {
    pub fn new(body: Bytes) -> Self {
        Self { remaining: Some(body) }
    }
}

#[async_trait]
impl BodySource for BufferedBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        Ok(self.remaining.take().filter(|b| !b.is_empty()))
    }
}

/// Adapter: a winning backend read used as the body of another request
/// (server-side copy, version archiving).
pub struct StreamedBody {
    stream: StreamingResponse,
    node_timeout: Duration,
}

impl StreamedBody {
    pub fn new(stream: StreamingResponse, node_timeout: Duration) -> Self {
        Self { stream, node_timeout }
    }
}

#[async_trait]
impl BodySource for StreamedBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        match tokio::time::timeout(self.node_timeout, self.stream.exchange.next_chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(err)) => Err(BodyError::Source(err.to_string())),
            Err(_) => Err(BodyError::Source("copy source read timed out".into())),
        }
    }
}

/// Majority needed for a write of `replicas` copies.
pub fn quorum(replicas: usize) -> usize {
    replicas / 2 + 1
}

/// Pick the response that represents the set: the first status class (2xx,
/// then 3xx, then 4xx) holding a strict majority wins, represented by its
/// highest status. No majority anywhere is a 503.
pub fn best_response(responses: &[CollectedResponse], etag: Option<String>) -> BestResponse {
    let total = responses.len();
    for class in [200u16, 300, 400] {
        let in_class: Vec<&CollectedResponse> = responses
            .iter()
            .filter(|r| {
                let code = r.status.as_u16();
                class <= code && code < class + 100
            })
            .collect();
        if in_class.len() * 2 > total {
            let status = in_class.iter().map(|r| r.status).max().unwrap_or(StatusCode::OK);
            if let Some(chosen) = in_class.iter().find(|r| r.status == status) {
                return BestResponse {
                    status,
                    headers: chosen.headers.clone(),
                    body: chosen.body.clone(),
                    etag,
                };
            }
        }
    }
    tracing::error!(responses = total, "no backend majority; returning 503");
    BestResponse {
        status: StatusCode::SERVICE_UNAVAILABLE,
        headers: HeaderMap::new(),
        body: Bytes::new(),
        etag: None,
    }
}

struct Writer {
    node: Node,
    exchange: Box<dyn Exchange>,
    /// Backend answered at the expect phase; it gets no body bytes but its
    /// response still counts.
    early: bool,
}

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub connect_timeout: Duration,
    pub node_timeout: Duration,
    pub abort_on_disk_full: bool,
}

/// The fan-out coordinator. One per application; cheap to clone.
#[derive(Clone)]
pub struct Replicator {
    transport: Arc<dyn Transport>,
    config: ReplicatorConfig,
}

impl Replicator {
    pub fn new(transport: Arc<dyn Transport>, config: ReplicatorConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn node_timeout(&self) -> Duration {
        self.config.node_timeout
    }

    /// Header-only replicated dispatch: one request per replica, failed
    /// attempts replaced from the iterator, every response collected.
    pub async fn make_requests(
        &self,
        nodes: &mut NodeIterator,
        limiter: &ErrorLimiter,
        part: u32,
        head: &RequestHead,
        replicas: usize,
    ) -> Vec<CollectedResponse> {
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..replicas {
            match nodes.next() {
                Some(node) => in_flight.push(self.single_request(node, part, head.clone())),
                None => break,
            }
        }
        let mut collected = Vec::with_capacity(replicas);
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(resp) => {
                    self.note_response_status(limiter, &resp);
                    collected.push(resp);
                }
                Err((node, err)) => {
                    self.note_exchange_error(limiter, &node, &err);
                    if let Some(next) = nodes.next() {
                        in_flight.push(self.single_request(next, part, head.clone()));
                    }
                }
            }
        }
        collected
    }

    /// Replicated read. Serial first-good walk, or an all-nodes newest race
    /// when `newest` is set.
    pub async fn read(
        &self,
        nodes: &mut NodeIterator,
        limiter: &ErrorLimiter,
        part: u32,
        head: &RequestHead,
        newest: bool,
        replicas: usize,
    ) -> ReadOutcome {
        if newest {
            return self.read_newest(nodes, limiter, part, head, replicas).await;
        }
        let mut collected = Vec::new();
        while let Some(node) = nodes.next() {
            match self.open_read(node.clone(), part, head).await {
                Ok((resp_head, exchange)) => {
                    let status = resp_head.status;
                    if status.is_success() || status.is_redirection() {
                        return ReadOutcome::Stream(StreamingResponse {
                            node,
                            head: resp_head,
                            exchange,
                        });
                    }
                    if status.is_server_error() {
                        self.note_5xx(limiter, &node, status);
                    }
                    let body = self
                        .buffer_body(exchange, ERROR_BODY_MAX)
                        .await
                        .unwrap_or_default();
                    collected.push(CollectedResponse {
                        node,
                        status,
                        headers: resp_head.headers,
                        body,
                    });
                }
                Err(err) => {
                    self.note_exchange_error(limiter, &node, &err);
                }
            }
        }
        ReadOutcome::Error(best_response(&collected, None))
    }

    async fn read_newest(
        &self,
        nodes: &mut NodeIterator,
        limiter: &ErrorLimiter,
        part: u32,
        head: &RequestHead,
        replicas: usize,
    ) -> ReadOutcome {
        let mut in_flight = FuturesUnordered::new();
        let mut seq = 0usize;
        for _ in 0..replicas {
            match nodes.next() {
                Some(node) => {
                    in_flight.push(self.open_read_tagged(node, part, head.clone(), seq));
                    seq += 1;
                }
                None => break,
            }
        }
        let mut candidates: Vec<(usize, StreamingResponse)> = Vec::new();
        let mut losers: Vec<CollectedResponse> = Vec::new();
        while let Some(result) = in_flight.next().await {
            match result {
                Ok((order, node, resp_head, exchange)) => {
                    let status = resp_head.status;
                    if status.is_success() || status.is_redirection() {
                        candidates.push((
                            order,
                            StreamingResponse { node, head: resp_head, exchange },
                        ));
                    } else {
                        if status.is_server_error() {
                            self.note_5xx(limiter, &node, status);
                        }
                        losers.push(CollectedResponse {
                            node,
                            status,
                            headers: resp_head.headers,
                            body: Bytes::new(),
                        });
                    }
                }
                Err((node, err)) => {
                    self.note_exchange_error(limiter, &node, &err);
                    if let Some(next) = nodes.next() {
                        in_flight.push(self.open_read_tagged(next, part, head.clone(), seq));
                        seq += 1;
                    }
                }
            }
        }
        if candidates.is_empty() {
            return ReadOutcome::Error(best_response(&losers, None));
        }
        // Highest timestamp wins; equal stamps resolve to the earliest node
        // in try order.
        candidates.sort_by_key(|(order, _)| *order);
        let mut winner_at = 0usize;
        let mut newest_ts = candidates[0].1.head.timestamp();
        for (i, (_, candidate)) in candidates.iter().enumerate().skip(1) {
            let ts = candidate.head.timestamp();
            if ts > newest_ts {
                newest_ts = ts;
                winner_at = i;
            }
        }
        ReadOutcome::Stream(candidates.swap_remove(winner_at).1)
    }

    /// Streamed replicated write with quorum enforcement.
    ///
    /// Returns all collected responses plus the agreed backend etag, or the
    /// error that killed the request.
    pub async fn stream_put(
        &self,
        nodes: &mut NodeIterator,
        limiter: &ErrorLimiter,
        part: u32,
        head: &RequestHead,
        body: &mut dyn BodySource,
        replicas: usize,
    ) -> Result<(Vec<CollectedResponse>, Option<String>), ProxyError> {
        let required = quorum(replicas);
        let mut writers = self.establish_writers(nodes, limiter, part, head, replicas).await;
        if writers.len() < required {
            return Err(ProxyError::QuorumFailure { ready: writers.len(), required });
        }

        loop {
            let chunk = match body.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(BodyError::Timeout(after)) => return Err(ProxyError::ClientTimeout(after)),
                Err(BodyError::Disconnect) => return Err(ProxyError::ClientDisconnect),
                Err(BodyError::Source(reason)) => return Err(ProxyError::Manifest(reason)),
            };
            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + CHUNK_SIZE).min(chunk.len());
                let piece = chunk.slice(offset..end);
                offset = end;
                self.pump_piece(&mut writers, limiter, piece).await?;
                if writers.len() < required {
                    return Err(ProxyError::QuorumFailure {
                        ready: writers.len(),
                        required,
                    });
                }
            }
        }

        // Terminate bodies on everything still alive.
        let finishes = futures::future::join_all(writers.iter_mut().map(|w| {
            let node_timeout = self.config.node_timeout;
            async move {
                if w.early {
                    return Ok(());
                }
                deadline(node_timeout, w.exchange.finish_body()).await
            }
        }))
        .await;
        let mut kept = Vec::with_capacity(writers.len());
        for (writer, result) in writers.into_iter().zip(finishes) {
            match result {
                Ok(()) => kept.push(writer),
                Err(err) => self.note_exchange_error(limiter, &writer.node, &err),
            }
        }
        let mut writers = kept;
        if writers.len() < required {
            return Err(ProxyError::QuorumFailure { ready: writers.len(), required });
        }

        // Collect every response.
        let mut collected = Vec::with_capacity(writers.len());
        for writer in writers.iter_mut() {
            match deadline(self.config.node_timeout, writer.exchange.read_response()).await {
                Ok(resp_head) => {
                    let body = self
                        .buffer_body_ref(writer.exchange.as_mut(), ERROR_BODY_MAX)
                        .await
                        .unwrap_or_default();
                    let resp = CollectedResponse {
                        node: writer.node.clone(),
                        status: resp_head.status,
                        headers: resp_head.headers,
                        body,
                    };
                    self.note_response_status(limiter, &resp);
                    collected.push(resp);
                }
                Err(err) => self.note_exchange_error(limiter, &writer.node, &err),
            }
        }

        // Successful backends must agree on what they stored.
        let mut agreed: Option<String> = None;
        for resp in collected.iter().filter(|r| r.status.is_success()) {
            let etag = resp
                .headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(|v| crate::headers::unquote_etag(v).to_string());
            match (&agreed, etag) {
                (None, Some(etag)) => agreed = Some(etag),
                (Some(seen), Some(etag)) if *seen != etag => {
                    tracing::error!(expected = %seen, got = %etag, "etag mismatch across write set");
                    return Err(ProxyError::InconsistentEtag);
                }
                _ => {}
            }
        }
        Ok((collected, agreed))
    }

    async fn establish_writers(
        &self,
        nodes: &mut NodeIterator,
        limiter: &ErrorLimiter,
        part: u32,
        head: &RequestHead,
        replicas: usize,
    ) -> Vec<Writer> {
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..replicas {
            match nodes.next() {
                Some(node) => in_flight.push(self.open_writer(node, part, head.clone())),
                None => break,
            }
        }
        let mut writers = Vec::with_capacity(replicas);
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(writer) => writers.push(writer),
                Err((node, err)) => {
                    self.note_exchange_error(limiter, &node, &err);
                    if let Some(next) = nodes.next() {
                        in_flight.push(self.open_writer(next, part, head.clone()));
                    }
                }
            }
        }
        writers
    }

    /// Write one piece to every live writer in parallel; writers that fail
    /// are probed for a disk-full response and dropped.
    async fn pump_piece(
        &self,
        writers: &mut Vec<Writer>,
        limiter: &ErrorLimiter,
        piece: Bytes,
    ) -> Result<(), ProxyError> {
        let node_timeout = self.config.node_timeout;
        let results = futures::future::join_all(writers.iter_mut().map(|w| {
            let piece = piece.clone();
            async move {
                if w.early {
                    return Ok(());
                }
                deadline(node_timeout, w.exchange.send_chunk(piece)).await
            }
        }))
        .await;

        let mut kept = Vec::with_capacity(writers.len());
        let mut failed = Vec::new();
        for (writer, result) in std::mem::take(writers).into_iter().zip(results) {
            match result {
                Ok(()) => kept.push(writer),
                Err(err) => failed.push((writer, err)),
            }
        }
        *writers = kept;

        for (mut writer, err) in failed {
            // A backend that died mid-write may have flushed its refusal.
            let disk_full = match deadline(WRITE_FAILURE_PROBE, writer.exchange.read_response())
                .await
            {
                Ok(head) if head.status.as_u16() == 507 => true,
                _ => false,
            };
            if disk_full {
                limiter.record_fatal(&writer.node);
                if self.config.abort_on_disk_full {
                    return Err(ProxyError::Transport(TransportError::ExpectRefused(507)));
                }
            } else {
                self.note_exchange_error(limiter, &writer.node, &err);
            }
            tracing::warn!(node = %writer.node, error = %err, "writer dropped mid-body");
        }
        Ok(())
    }

    async fn open_writer(
        &self,
        node: Node,
        part: u32,
        head: RequestHead,
    ) -> Result<Writer, (Node, TransportError)> {
        let attempt = async {
            let mut exchange =
                deadline(self.config.connect_timeout, self.transport.connect(&node, part, &head))
                    .await?;
            let interim = deadline(self.config.node_timeout, exchange.await_continue()).await?;
            let early = interim != StatusCode::CONTINUE;
            Ok::<_, TransportError>((exchange, early))
        };
        match attempt.await {
            Ok((exchange, early)) => Ok(Writer { node, exchange, early }),
            Err(err) => Err((node, err)),
        }
    }

    async fn open_read(
        &self,
        node: Node,
        part: u32,
        head: &RequestHead,
    ) -> Result<(ResponseHead, Box<dyn Exchange>), TransportError> {
        let mut exchange =
            deadline(self.config.connect_timeout, self.transport.connect(&node, part, head))
                .await?;
        let resp_head = deadline(self.config.node_timeout, exchange.read_response()).await?;
        Ok((resp_head, exchange))
    }

    async fn open_read_tagged(
        &self,
        node: Node,
        part: u32,
        head: RequestHead,
        order: usize,
    ) -> Result<(usize, Node, ResponseHead, Box<dyn Exchange>), (Node, TransportError)> {
        match self.open_read(node.clone(), part, &head).await {
            Ok((resp_head, exchange)) => Ok((order, node, resp_head, exchange)),
            Err(err) => Err((node, err)),
        }
    }

    async fn single_request(
        &self,
        node: Node,
        part: u32,
        head: RequestHead,
    ) -> Result<CollectedResponse, (Node, TransportError)> {
        let attempt = async {
            let (resp_head, exchange) = self.open_read(node.clone(), part, &head).await?;
            let body = self.buffer_body(exchange, ERROR_BODY_MAX).await?;
            Ok::<_, TransportError>(CollectedResponse {
                node: node.clone(),
                status: resp_head.status,
                headers: resp_head.headers,
                body,
            })
        };
        attempt.await.map_err(|err| (node, err))
    }

    /// Drain an exchange body into memory, truncating at `max`.
    async fn buffer_body(
        &self,
        mut exchange: Box<dyn Exchange>,
        max: usize,
    ) -> Result<Bytes, TransportError> {
        self.buffer_body_ref(exchange.as_mut(), max).await
    }

    async fn buffer_body_ref(
        &self,
        exchange: &mut dyn Exchange,
        max: usize,
    ) -> Result<Bytes, TransportError> {
        let mut out = BytesMut::new();
        while let Some(chunk) =
            deadline(self.config.node_timeout, exchange.next_chunk()).await?
        {
            let room = max.saturating_sub(out.len());
            if room == 0 {
                break;
            }
            let take = room.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            if take < chunk.len() {
                break;
            }
        }
        Ok(out.freeze())
    }

    /// Fully buffer a winning read, for listings and small internal GETs.
    pub async fn buffer_stream(
        &self,
        stream: &mut StreamingResponse,
    ) -> Result<Bytes, TransportError> {
        self.buffer_body_ref(stream.exchange.as_mut(), BUFFERED_BODY_MAX).await
    }

    fn note_response_status(&self, limiter: &ErrorLimiter, resp: &CollectedResponse) {
        if resp.status.is_server_error() {
            self.note_5xx(limiter, &resp.node, resp.status);
        }
    }

    fn note_5xx(&self, limiter: &ErrorLimiter, node: &Node, status: StatusCode) {
        if status.as_u16() == 507 {
            limiter.record_fatal(node);
        } else {
            limiter.record(node);
        }
        tracing::debug!(node = %node, status = status.as_u16(), "backend server error");
    }

    fn note_exchange_error(&self, limiter: &ErrorLimiter, node: &Node, err: &TransportError) {
        if err.is_disk_full() {
            limiter.record_fatal(node);
        } else {
            limiter.record(node);
        }
        tracing::debug!(node = %node, error = %err, "backend exchange failed");
    }
}

async fn deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
