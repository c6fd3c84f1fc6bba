//! Manifest-assembled large objects.
//!
//! A manifest object is a zero-byte object whose `X-Object-Manifest:
//! <container>/<prefix>` header points at segment objects that concatenate
//! into its logical body. GET walks the segment listing and splices the
//! segment bodies; when the listing fits in one page the composite length and
//! etag are computed up front, otherwise the response streams chunked while
//! paging. Range requests are honored only in the sized case.

use crate::app::Application;
use crate::constraints::CONTAINER_LISTING_LIMIT;
use crate::controllers::base::backend_headers;
use crate::controllers::{empty_body, text_response, ClientRequest, ProxyBody, ProxyResponse};
use crate::error::ProxyError;
use crate::error_limit::ErrorLimiter;
use crate::headers::client_response_headers;
use crate::node_iter::NodeIterator;
use crate::replicate::{BodyError, BodySource, ReadOutcome, Replicator, StreamingResponse};
use crate::ring::Ring;
use crate::sleeper::Sleeper;
use crate::clock::Clock;
use crate::transport::{RequestHead, ResponseHead};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderValue;
use http::{HeaderMap, Method, Response, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const QUERY_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

/// One entry of a JSON container listing used as a segment manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SegmentSpec {
    pub name: String,
    pub bytes: u64,
    pub hash: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub last_modified: String,
}

/// A single client byte range. Only one range per request is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-` or `bytes=a-b`.
    From(u64, Option<u64>),
    /// `bytes=-n`: the final n bytes.
    Suffix(u64),
}

/// Parse a `Range` header; multi-range requests are not supported and parse
/// as `None` (served as a full 200).
pub fn parse_range(header: &str) -> Option<RangeSpec> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start = start.trim();
    let end = end.trim();
    if start.is_empty() {
        return end.parse().ok().map(RangeSpec::Suffix);
    }
    let start: u64 = start.parse().ok()?;
    if end.is_empty() {
        return Some(RangeSpec::From(start, None));
    }
    let end: u64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some(RangeSpec::From(start, Some(end)))
}

/// Resolve a range against a total length into inclusive `(start, end)`.
/// `None` means unsatisfiable (416).
pub fn resolve_range(spec: RangeSpec, total: u64) -> Option<(u64, u64)> {
    match spec {
        RangeSpec::From(start, end) => {
            if start >= total {
                return None;
            }
            let end = end.map_or(total - 1, |e| e.min(total - 1));
            Some((start, end))
        }
        RangeSpec::Suffix(n) => {
            if n == 0 || total == 0 {
                return None;
            }
            Some((total.saturating_sub(n), total - 1))
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConsolidateError {
    /// The segment listing spilled past one page; a copy would be unbounded.
    #[error("manifest has too many segments to consolidate")]
    TooManySegments,
    /// The segment listing could not be fetched.
    #[error("segment listing failed with status {0}")]
    Listing(StatusCode),
}

/// Walks a segment listing, streaming segment bodies in listing order.
///
/// Owns every handle it needs so it can live inside a response body (or a
/// PUT body source) independent of the application borrow. The explicit
/// cursor makes the range arithmetic and the rate limiting testable.
pub struct SegmentWalker {
    replicator: Replicator,
    container_ring: Arc<Ring>,
    container_limiter: Arc<ErrorLimiter>,
    object_ring: Arc<Ring>,
    object_limiter: Arc<ErrorLimiter>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    base_headers: HeaderMap,
    max_handoffs_container: usize,
    max_handoffs_object: usize,
    log_handoffs: bool,

    account: String,
    container: String,
    prefix: String,
    page: VecDeque<SegmentSpec>,
    /// Marker for the next listing page; `None` once the listing is done.
    next_marker: Option<Option<String>>,
    current: Option<StreamingResponse>,
    /// Bytes still to discard before emitting (range start).
    skip: u64,
    /// Bytes still to emit; `u64::MAX` means unbounded.
    take: u64,
    /// Pending manual skip for the current segment (backend ignored Range).
    trim_current: u64,
    segments_fetched: usize,
    rate_limit_after_segment: usize,
    rate_limit_segments_per_sec: f64,
    next_fetch_micros: u64,
}

impl SegmentWalker {
    fn new(app: &Application, req: &ClientRequest, container: &str, prefix: &str) -> Self {
        Self {
            replicator: app.replicator.clone(),
            container_ring: app.container_ring.clone(),
            container_limiter: app.container_limiter.clone(),
            object_ring: app.object_ring.clone(),
            object_limiter: app.object_limiter.clone(),
            sleeper: app.sleeper.clone(),
            clock: app.clock.clone(),
            base_headers: backend_headers(req),
            max_handoffs_container: app
                .config
                .max_handoffs
                .unwrap_or_else(|| app.container_ring.replica_count()),
            max_handoffs_object: app
                .config
                .max_handoffs
                .unwrap_or_else(|| app.object_ring.replica_count()),
            log_handoffs: app.config.log_handoffs,
            account: req.account.clone(),
            container: container.to_string(),
            prefix: prefix.to_string(),
            page: VecDeque::new(),
            next_marker: Some(None),
            current: None,
            skip: 0,
            take: u64::MAX,
            trim_current: 0,
            segments_fetched: 0,
            rate_limit_after_segment: app.config.rate_limit_after_segment,
            rate_limit_segments_per_sec: app.config.rate_limit_segments_per_sec,
            next_fetch_micros: 0,
        }
    }

    fn preloaded(mut self, page: Vec<SegmentSpec>, listing_complete: bool) -> Self {
        let marker = page.last().map(|seg| seg.name.clone());
        self.page = page.into();
        self.next_marker = if listing_complete { None } else { Some(Some(marker.unwrap_or_default())) };
        self
    }

    fn with_window(mut self, skip: u64, take: u64) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    async fn fetch_page(&mut self) -> Result<(), ProxyError> {
        let Some(marker) = self.next_marker.clone() else {
            return Ok(());
        };
        let mut query = format!(
            "format=json&limit={}&prefix={}",
            CONTAINER_LISTING_LIMIT,
            utf8_percent_encode(&self.prefix, QUERY_KEEP)
        );
        if let Some(marker) = &marker {
            if !marker.is_empty() {
                query.push_str(&format!("&marker={}", utf8_percent_encode(marker, QUERY_KEEP)));
            }
        }
        let mut head = RequestHead::new(
            Method::GET,
            format!("/{}/{}", self.account, self.container),
        );
        head.headers = self.base_headers.clone();
        head.query = Some(query);

        let part = self.container_ring.partition(&self.account, Some(&self.container), None);
        let mut nodes = NodeIterator::new(
            self.container_ring.clone(),
            part,
            self.container_limiter.clone(),
            self.max_handoffs_container,
            self.log_handoffs,
        );
        let outcome = self
            .replicator
            .read(
                &mut nodes,
                &self.container_limiter,
                part,
                &head,
                false,
                self.container_ring.replica_count(),
            )
            .await;
        let page: Vec<SegmentSpec> = match outcome {
            ReadOutcome::Stream(mut stream) => {
                let body = self
                    .replicator
                    .buffer_stream(&mut stream)
                    .await
                    .map_err(|e| ProxyError::Manifest(e.to_string()))?;
                if stream.head.status == StatusCode::NO_CONTENT || body.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_slice(&body)
                        .map_err(|e| ProxyError::Manifest(format!("bad listing: {e}")))?
                }
            }
            ReadOutcome::Error(best) => {
                return Err(ProxyError::Manifest(format!(
                    "segment listing failed with status {}",
                    best.status
                )))
            }
        };
        self.next_marker = if page.len() < CONTAINER_LISTING_LIMIT {
            None
        } else {
            Some(Some(page.last().map(|seg| seg.name.clone()).unwrap_or_default()))
        };
        self.page = page.into();
        Ok(())
    }

    /// Sleep long enough to keep the segment fetch rate under the cap.
    async fn throttle(&mut self) {
        if self.segments_fetched <= self.rate_limit_after_segment
            || self.rate_limit_segments_per_sec <= 0.0
        {
            return;
        }
        let interval = (1_000_000.0 / self.rate_limit_segments_per_sec) as u64;
        let now = self.clock.now_micros();
        if self.next_fetch_micros == 0 {
            self.next_fetch_micros = now + interval;
            return;
        }
        if now < self.next_fetch_micros {
            let wait = self.next_fetch_micros - now;
            self.sleeper.sleep(Duration::from_micros(wait)).await;
        }
        self.next_fetch_micros += interval;
    }

    async fn open_segment(&mut self, seg: &SegmentSpec) -> Result<(), ProxyError> {
        self.throttle().await;
        let mut head = RequestHead::new(
            Method::GET,
            format!("/{}/{}/{}", self.account, self.container, seg.name),
        );
        head.headers = self.base_headers.clone();
        self.trim_current = 0;
        if self.skip > 0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes={}-", self.skip)) {
                head.headers.insert("range", value);
            }
        } else if self.take != u64::MAX && self.take < seg.bytes {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes=0-{}", self.take - 1)) {
                head.headers.insert("range", value);
            }
        }

        let part = self
            .object_ring
            .partition(&self.account, Some(&self.container), Some(&seg.name));
        let mut nodes = NodeIterator::new(
            self.object_ring.clone(),
            part,
            self.object_limiter.clone(),
            self.max_handoffs_object,
            self.log_handoffs,
        );
        let outcome = self
            .replicator
            .read(
                &mut nodes,
                &self.object_limiter,
                part,
                &head,
                false,
                self.object_ring.replica_count(),
            )
            .await;
        match outcome {
            ReadOutcome::Stream(stream) => {
                if self.skip > 0 && stream.head.status != StatusCode::PARTIAL_CONTENT {
                    // Backend ignored the range; discard by hand.
                    self.trim_current = self.skip;
                }
                self.skip = 0;
                self.segments_fetched += 1;
                self.current = Some(stream);
                Ok(())
            }
            ReadOutcome::Error(best) => Err(ProxyError::Manifest(format!(
                "segment {:?} failed with status {}",
                seg.name, best.status
            ))),
        }
    }

    /// Next bytes of the composite body; `None` when complete.
    pub async fn next_bytes(&mut self) -> Option<Result<Bytes, ProxyError>> {
        loop {
            if self.take == 0 {
                return None;
            }
            if let Some(stream) = self.current.as_mut() {
                let node_timeout = self.replicator.node_timeout();
                let read = tokio::time::timeout(node_timeout, stream.exchange.next_chunk()).await;
                match read {
                    Ok(Ok(Some(mut chunk))) => {
                        if self.trim_current > 0 {
                            if (chunk.len() as u64) <= self.trim_current {
                                self.trim_current -= chunk.len() as u64;
                                continue;
                            }
                            chunk = chunk.slice(self.trim_current as usize..);
                            self.trim_current = 0;
                        }
                        if (chunk.len() as u64) > self.take {
                            chunk = chunk.slice(..self.take as usize);
                        }
                        if chunk.is_empty() {
                            continue;
                        }
                        self.take = self.take.saturating_sub(chunk.len() as u64);
                        return Some(Ok(chunk));
                    }
                    Ok(Ok(None)) => {
                        self.current = None;
                        continue;
                    }
                    Ok(Err(err)) => {
                        return Some(Err(ProxyError::Manifest(err.to_string())));
                    }
                    Err(_) => {
                        return Some(Err(ProxyError::Manifest("segment read timed out".into())));
                    }
                }
            }
            // Advance to the next segment, paging as needed.
            if self.page.is_empty() {
                if self.next_marker.is_none() {
                    return None;
                }
                if let Err(err) = self.fetch_page().await {
                    return Some(Err(err));
                }
                if self.page.is_empty() && self.next_marker.is_none() {
                    return None;
                }
                continue;
            }
            let seg = self.page.pop_front()?;
            // Whole segments inside the skip window are never fetched.
            if self.skip >= seg.bytes {
                self.skip -= seg.bytes;
                continue;
            }
            if let Err(err) = self.open_segment(&seg).await {
                return Some(Err(err));
            }
        }
    }

    fn into_body(mut self) -> ProxyBody {
        let (tx, body) = crate::controllers::channel_body();
        tokio::spawn(async move {
            loop {
                let outcome = match self.next_bytes().await {
                    Some(Ok(chunk)) => Ok(chunk),
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "large object assembly aborted");
                        Err(err)
                    }
                    None => return,
                };
                let fatal = outcome.is_err();
                if tx.send(outcome).await.is_err() || fatal {
                    return;
                }
            }
        });
        body
    }
}

#[async_trait]
impl BodySource for SegmentWalker {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        match self.next_bytes().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(BodyError::Source(err.to_string())),
        }
    }
}

/// A consolidated manifest body for server-side copy: known length, known
/// etag, segments streamed through.
pub struct ConsolidatedSource {
    pub total: u64,
    pub etag: String,
    pub walker: SegmentWalker,
}

fn split_manifest(manifest: &str) -> Option<(&str, &str)> {
    let (container, prefix) = manifest.split_once('/')?;
    if container.is_empty() {
        return None;
    }
    Some((container, prefix))
}

fn composite_etag(page: &[SegmentSpec]) -> String {
    let concatenated: String = page.iter().map(|seg| seg.hash.as_str()).collect();
    format!("{:x}", md5::compute(concatenated.as_bytes()))
}

async fn first_page(
    app: &Application,
    req: &ClientRequest,
    container: &str,
    prefix: &str,
) -> Result<(Vec<SegmentSpec>, bool), ProxyError> {
    let mut walker = SegmentWalker::new(app, req, container, prefix);
    walker.fetch_page().await?;
    let complete = walker.next_marker.is_none();
    Ok((walker.page.into_iter().collect(), complete))
}

/// Build the composite GET/HEAD response for a manifest object.
pub async fn respond(
    app: &Application,
    req: &ClientRequest,
    manifest: &str,
    manifest_head: &ResponseHead,
    is_head: bool,
) -> Result<ProxyResponse, ProxyError> {
    let Some((container, prefix)) = split_manifest(manifest) else {
        return Ok(text_response(
            StatusCode::CONFLICT,
            &req.trans_id,
            "Invalid X-Object-Manifest",
        ));
    };
    let (page, complete) = first_page(app, req, container, prefix).await?;

    let mut headers = client_response_headers(&manifest_head.headers);
    headers.remove("etag");
    if let Ok(value) = HeaderValue::from_str(&req.trans_id) {
        headers.insert("x-trans-id", value);
    }
    headers.insert("accept-ranges", HeaderValue::from_static("bytes"));

    if !complete {
        // Unbounded listing: stream chunked, no length or etag, no ranges.
        let walker =
            SegmentWalker::new(app, req, container, prefix).preloaded(page, false);
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(map) = builder.headers_mut() {
            *map = headers;
        }
        let body = if is_head { empty_body() } else { walker.into_body() };
        return Ok(builder.body(body).unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &req.trans_id, "Error")
        }));
    }

    let total: u64 = page.iter().map(|seg| seg.bytes).sum();
    let etag = composite_etag(&page);
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert("etag", value);
    }

    let range = req.header("range").and_then(parse_range);
    let (status, skip, take) = match range {
        None => (StatusCode::OK, 0, total),
        Some(spec) => match resolve_range(spec, total) {
            Some((start, end)) => {
                if let Ok(value) = HeaderValue::from_str(&format!(
                    "bytes {start}-{end}/{total}"
                )) {
                    headers.insert("content-range", value);
                }
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
            None => {
                let mut builder =
                    Response::builder().status(StatusCode::RANGE_NOT_SATISFIABLE);
                if let Some(map) = builder.headers_mut() {
                    *map = headers;
                    if let Ok(value) =
                        HeaderValue::from_str(&format!("bytes */{total}"))
                    {
                        map.insert("content-range", value);
                    }
                    map.insert("content-length", HeaderValue::from_static("0"));
                }
                return Ok(builder.body(empty_body()).unwrap_or_else(|_| {
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, &req.trans_id, "Error")
                }));
            }
        },
    };

    if let Ok(value) = HeaderValue::from_str(&take.to_string()) {
        headers.insert("content-length", value);
    }
    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        *map = headers;
    }
    let body = if is_head || take == 0 {
        empty_body()
    } else {
        SegmentWalker::new(app, req, container, prefix)
            .preloaded(page, true)
            .with_window(skip, take)
            .into_body()
    };
    Ok(builder.body(body).unwrap_or_else(|_| {
        text_response(StatusCode::INTERNAL_SERVER_ERROR, &req.trans_id, "Error")
    }))
}

/// Resolve a manifest into a sized body for server-side copy. Fails when the
/// listing does not fit one page.
pub async fn consolidated_source(
    app: &Application,
    req: &ClientRequest,
    manifest: &str,
) -> Result<ConsolidatedSource, ConsolidateError> {
    let Some((container, prefix)) = split_manifest(manifest) else {
        return Err(ConsolidateError::Listing(StatusCode::CONFLICT));
    };
    let (page, complete) = first_page(app, req, container, prefix)
        .await
        .map_err(|_| ConsolidateError::Listing(StatusCode::SERVICE_UNAVAILABLE))?;
    if !complete {
        return Err(ConsolidateError::TooManySegments);
    }
    let total = page.iter().map(|seg| seg.bytes).sum();
    let etag = composite_etag(&page);
    let walker = SegmentWalker::new(app, req, container, prefix).preloaded(page, true);
    Ok(ConsolidatedSource { total, etag, walker })
}
