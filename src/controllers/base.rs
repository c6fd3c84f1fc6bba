//! Plumbing shared by the account, container and object controllers.

use crate::app::Application;
use crate::cache::{AccountInfo, ContainerInfo};
use crate::controllers::{text_response, AuthContext, ClientRequest, ProxyBody, ProxyResponse};
use crate::error::{ProxyError, TransportError};
use crate::headers::{client_response_headers, quote_etag};
use crate::replicate::{best_response, BestResponse, StreamingResponse};
use crate::transport::RequestHead;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Response, StatusCode};

/// Headers every backend request carries.
pub fn backend_headers(req: &ClientRequest) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&req.trans_id) {
        headers.insert("x-trans-id", value);
    }
    for name in ["referer", "user-agent"] {
        if let Some(value) = req.headers.get(name) {
            headers.insert(HeaderName::from_static(name), value.clone());
        }
    }
    headers
}

/// Stamp a mutating backend request.
pub fn stamp(headers: &mut HeaderMap, app: &Application) -> crate::timestamp::Timestamp {
    let ts = app.issuer.next();
    if let Ok(value) = HeaderValue::from_str(&ts.normal()) {
        headers.insert("x-timestamp", value);
    }
    ts
}

/// Run the request's authorization hook, if one was supplied.
pub fn authorize(req: &ClientRequest, acl: Option<&str>) -> Option<ProxyResponse> {
    let authorizer = req.authorizer.as_ref()?;
    let ctx = AuthContext {
        method: &req.method,
        account: &req.account,
        container: req.container.as_deref(),
        object: req.object.as_deref(),
        referer: req.header("referer"),
        acl,
    };
    let denial = authorizer.authorize(&ctx)?;
    tracing::info!(
        account = %req.account,
        status = denial.status.as_u16(),
        "authorization hook denied request"
    );
    Some(text_response(denial.status, &req.trans_id, &denial.message))
}

/// Account existence and counters, from cache or a serial HEAD walk (first
/// good node wins).
pub async fn account_info(app: &Application, req: &ClientRequest, account: &str) -> AccountInfo {
    if let Some(info) = app.cache.account(account).await {
        return info;
    }
    let mut head = RequestHead::new(Method::HEAD, format!("/{account}"));
    head.headers = backend_headers(req);
    let (part, mut nodes) = app.account_iter(account);
    let replicas = app.account_ring.replica_count();
    let outcome = app
        .replicator
        .read(&mut nodes, &app.account_limiter, part, &head, false, replicas)
        .await;
    let (status, headers) = match outcome {
        crate::replicate::ReadOutcome::Stream(stream) => {
            (stream.head.status.as_u16(), stream.head.headers)
        }
        crate::replicate::ReadOutcome::Error(best) => (best.status.as_u16(), best.headers),
    };
    let info = AccountInfo {
        status,
        container_count: header_u64(&headers, "x-account-container-count"),
        bytes_used: header_u64(&headers, "x-account-bytes-used"),
    };
    app.cache.set_account(account, &info, app.config.account_ttl()).await;
    info
}

/// Replicated account PUT used by autocreation.
pub async fn create_account(
    app: &Application,
    req: &ClientRequest,
    account: &str,
) -> BestResponse {
    let mut head = RequestHead::new(Method::PUT, format!("/{account}"));
    head.headers = backend_headers(req);
    stamp(&mut head.headers, app);
    let (part, mut nodes) = app.account_iter(account);
    let replicas = app.account_ring.replica_count();
    let collected = app
        .replicator
        .make_requests(&mut nodes, &app.account_limiter, part, &head, replicas)
        .await;
    app.cache.purge_account(account).await;
    best_response(&collected, None)
}

/// Container existence, ACLs and versioning attributes, from cache or a
/// replicated HEAD.
pub async fn container_info(
    app: &Application,
    req: &ClientRequest,
    account: &str,
    container: &str,
) -> ContainerInfo {
    if let Some(info) = app.cache.container(account, container).await {
        return info;
    }
    let mut head = RequestHead::new(Method::HEAD, format!("/{account}/{container}"));
    head.headers = backend_headers(req);
    let (part, mut nodes) = app.container_iter(account, container);
    let replicas = app.container_ring.replica_count();
    let outcome = app
        .replicator
        .read(&mut nodes, &app.container_limiter, part, &head, false, replicas)
        .await;
    let (status, headers) = match outcome {
        crate::replicate::ReadOutcome::Stream(stream) => {
            (stream.head.status.as_u16(), stream.head.headers)
        }
        crate::replicate::ReadOutcome::Error(best) => (best.status.as_u16(), best.headers),
    };
    let info = container_info_from_headers(status, &headers);
    app.cache.set_container(account, container, &info, app.config.container_ttl()).await;
    info
}

pub fn container_info_from_headers(status: u16, headers: &HeaderMap) -> ContainerInfo {
    ContainerInfo {
        status,
        read_acl: header_string(headers, "x-container-read"),
        write_acl: header_string(headers, "x-container-write"),
        versions_location: header_string(headers, "x-versions-location")
            .filter(|v| !v.is_empty()),
        sync_key: header_string(headers, "x-container-sync-key"),
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Translate a collected best response into the client-facing response.
pub fn best_to_response(
    best: &BestResponse,
    trans_id: &str,
    etag_is_object: bool,
) -> ProxyResponse {
    let mut builder = Response::builder().status(best.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = client_response_headers(&best.headers);
        if let Some(etag) = &best.etag {
            let rendered =
                if etag_is_object { quote_etag(etag) } else { etag.clone() };
            if let Ok(value) = HeaderValue::from_str(&rendered) {
                headers.insert("etag", value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(trans_id) {
            headers.insert("x-trans-id", value);
        }
        headers.insert(
            "content-length",
            HeaderValue::from_str(&best.body.len().to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
    }
    builder
        .body(crate::controllers::full_body(best.body.clone()))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, trans_id, "Error"))
}

/// Body that relays a winning backend stream, applying the per-read node
/// timeout. A mid-stream failure terminates the connection (truncation).
pub fn stream_body(app: &Application, stream: StreamingResponse) -> ProxyBody {
    stream_body_range(app, stream, 0, u64::MAX)
}

/// Stream a byte window `[skip, skip+take)` of the backend body. The driver
/// task stops when the client goes away (the channel closes under it),
/// dropping the backend connection with it.
pub fn stream_body_range(
    app: &Application,
    mut stream: StreamingResponse,
    mut skip: u64,
    mut take: u64,
) -> ProxyBody {
    let node_timeout = app.replicator.node_timeout();
    let (tx, body) = crate::controllers::channel_body();
    tokio::spawn(async move {
        loop {
            if take == 0 {
                return;
            }
            let next = tokio::time::timeout(node_timeout, stream.exchange.next_chunk()).await;
            let outcome = match next {
                Ok(Ok(Some(mut chunk))) => {
                    if skip > 0 {
                        if (chunk.len() as u64) <= skip {
                            skip -= chunk.len() as u64;
                            continue;
                        }
                        chunk = chunk.slice(skip as usize..);
                        skip = 0;
                    }
                    if (chunk.len() as u64) > take {
                        chunk = chunk.slice(..take as usize);
                    }
                    take = take.saturating_sub(chunk.len() as u64);
                    Ok(chunk)
                }
                Ok(Ok(None)) => return,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "backend stream failed mid-body");
                    Err(ProxyError::Transport(err))
                }
                Err(_) => {
                    tracing::warn!("backend stream timed out mid-body");
                    Err(ProxyError::Transport(TransportError::Timeout(node_timeout)))
                }
            };
            let fatal = outcome.is_err();
            if tx.send(outcome).await.is_err() || fatal {
                return;
            }
        }
    });
    body
}

/// Build the client response for a winning streamed read.
pub fn streamed_response(
    app: &Application,
    stream: StreamingResponse,
    trans_id: &str,
    is_head: bool,
) -> ProxyResponse {
    let mut builder = Response::builder().status(stream.head.status);
    let content_length = stream.head.content_length();
    if let Some(headers) = builder.headers_mut() {
        *headers = client_response_headers(&stream.head.headers);
        if let Ok(value) = HeaderValue::from_str(trans_id) {
            headers.insert("x-trans-id", value);
        }
        headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
        if let Some(len) = content_length {
            headers.insert(
                "content-length",
                HeaderValue::from_str(&len.to_string())
                    .unwrap_or(HeaderValue::from_static("0")),
            );
        }
    }
    let body = if is_head || content_length == Some(0) {
        crate::controllers::empty_body()
    } else {
        stream_body(app, stream)
    };
    builder
        .body(body)
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, trans_id, "Error"))
}

/// Buffer a winning streamed read fully (listings, internal lookups).
pub async fn buffer_stream(
    app: &Application,
    mut stream: StreamingResponse,
) -> Result<(crate::transport::ResponseHead, Bytes), TransportError> {
    let body = app.replicator.buffer_stream(&mut stream).await?;
    Ok((stream.head, body))
}

/// Standard 404 with the transaction id attached.
pub fn not_found(trans_id: &str) -> ProxyResponse {
    text_response(StatusCode::NOT_FOUND, trans_id, "Not Found")
}
