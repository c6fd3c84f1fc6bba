//! Object verb handlers, including server-side copy, delayed deletion and
//! the versioning and large-object hooks.

use crate::app::Application;
use crate::cache::ContainerInfo;
use crate::constraints::{check_metadata, check_object_creation, Resource, MAX_FILE_SIZE};
use crate::controllers::base;
use crate::controllers::{text_response, ClientRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::headers::{fold_remove_headers, object_write_headers, quote_etag};
use crate::large_object::{self, parse_range, resolve_range, ConsolidateError};
use crate::replicate::{best_response, BodySource, ReadOutcome, StreamedBody};
use crate::transport::{BodyKind, RequestHead};
use crate::versioned;
use http::header::HeaderValue;
use http::{HeaderMap, Method, StatusCode};

pub async fn handle(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    match req.method.as_str() {
        "GET" | "HEAD" => get_or_head(app, req).await,
        "PUT" => put(app, req).await,
        "POST" => post(app, req).await,
        "DELETE" => delete(app, req).await,
        "COPY" => copy(app, req).await,
        _ => Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &req.trans_id,
            "Method Not Allowed",
        )),
    }
}

fn names(req: &ClientRequest) -> (String, String) {
    (
        req.container.clone().unwrap_or_default(),
        req.object.clone().unwrap_or_default(),
    )
}

/// Container lookup shared by every object verb; missing account or
/// container answers 404 without touching object nodes.
async fn resolve_container(
    app: &Application,
    req: &ClientRequest,
) -> Result<ContainerInfo, ProxyResponse> {
    let (container, _) = names(req);
    let info = base::container_info(app, req, &req.account, &container).await;
    if info.exists() {
        Ok(info)
    } else {
        Err(base::not_found(&req.trans_id))
    }
}

/// Client conditional headers forwarded to object servers.
const CONDITIONALS: &[&str] =
    &["if-match", "if-none-match", "if-modified-since", "if-unmodified-since"];

fn read_head(req: &ClientRequest, container: &str, object: &str) -> RequestHead {
    let mut head = RequestHead::new(
        req.method.clone(),
        format!("/{}/{}/{}", req.account, container, object),
    );
    head.headers = base::backend_headers(req);
    for name in CONDITIONALS {
        if let Some(value) = req.headers.get(*name) {
            head.headers.insert(http::header::HeaderName::from_static(name), value.clone());
        }
    }
    head
}

fn ensure_quoted_etag(resp: &mut ProxyResponse) {
    let quoted = resp
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(quote_etag);
    if let Some(quoted) = quoted {
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            resp.headers_mut().insert("etag", value);
        }
    }
}

async fn get_or_head(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let cinfo = match resolve_container(app, &req).await {
        Ok(info) => info,
        Err(resp) => return Ok(resp),
    };
    if let Some(denied) = base::authorize(&req, cinfo.read_acl.as_deref()) {
        return Ok(denied);
    }
    let (container, object) = names(&req);
    let is_head = req.method == Method::HEAD;
    // The backend GET never carries the client Range; ranges are applied
    // proxy-side so manifest detection stays uniform.
    let head = read_head(&req, &container, &object);
    let (part, mut nodes) = app.object_iter(&req.account, &container, &object);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            req.wants_newest(),
            app.object_ring.replica_count(),
        )
        .await;
    let stream = match outcome {
        ReadOutcome::Stream(stream) => stream,
        ReadOutcome::Error(best) => {
            return Ok(base::best_to_response(&best, &req.trans_id, false))
        }
    };

    if let Some(manifest) = stream.head.header("x-object-manifest").map(str::to_string) {
        return large_object::respond(app, &req, &manifest, &stream.head, is_head).await;
    }

    let range = if is_head { None } else { req.header("range").and_then(parse_range) };
    if let (Some(spec), Some(total)) = (range, stream.head.content_length()) {
        let Some((start, end)) = resolve_range(spec, total) else {
            let mut resp = text_response(StatusCode::RANGE_NOT_SATISFIABLE, &req.trans_id, "");
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
                resp.headers_mut().insert("content-range", value);
            }
            return Ok(resp);
        };
        let take = end - start + 1;
        let mut builder = http::Response::builder().status(StatusCode::PARTIAL_CONTENT);
        if let Some(map) = builder.headers_mut() {
            *map = crate::headers::client_response_headers(&stream.head.headers);
            if let Ok(value) = HeaderValue::from_str(&req.trans_id) {
                map.insert("x-trans-id", value);
            }
            map.insert("accept-ranges", HeaderValue::from_static("bytes"));
            if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")) {
                map.insert("content-range", value);
            }
            if let Ok(value) = HeaderValue::from_str(&take.to_string()) {
                map.insert("content-length", value);
            }
        }
        let body = base::stream_body_range(app, stream, start, take);
        let mut resp = builder.body(body).unwrap_or_else(|_| {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, &req.trans_id, "Error")
        });
        ensure_quoted_etag(&mut resp);
        return Ok(resp);
    }

    let mut resp = base::streamed_response(app, stream, &req.trans_id, is_head);
    ensure_quoted_etag(&mut resp);
    Ok(resp)
}

/// Convert `X-Delete-After` into `X-Delete-At` and validate both.
fn convert_delete_headers(
    app: &Application,
    headers: &mut HeaderMap,
) -> Result<(), (StatusCode, String)> {
    let now = (app.clock.now_secs()) as i64;
    if let Some(raw) = headers.get("x-delete-after").cloned() {
        let seconds: i64 = raw
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or((StatusCode::BAD_REQUEST, "Non-integer X-Delete-After".to_string()))?;
        if seconds < 0 {
            return Err((StatusCode::BAD_REQUEST, "Non-integer X-Delete-After".to_string()));
        }
        headers.remove("x-delete-after");
        if let Ok(value) = HeaderValue::from_str(&(now + seconds).to_string()) {
            headers.insert("x-delete-at", value);
        }
    }
    if let Some(raw) = headers.get("x-delete-at") {
        let at: i64 = raw
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or((StatusCode::BAD_REQUEST, "Non-integer X-Delete-At".to_string()))?;
        if at < now {
            return Err((StatusCode::BAD_REQUEST, "X-Delete-At in past".to_string()));
        }
    }
    Ok(())
}

/// `<container>/<object>` reference used by `X-Copy-From` and `Destination`.
fn parse_cross_ref(value: &str) -> Option<(String, String)> {
    let value = value.strip_prefix('/').unwrap_or(value);
    let (container, object) = value.split_once('/')?;
    if container.is_empty() || object.is_empty() {
        return None;
    }
    Some((container.to_string(), object.to_string()))
}

struct PutSource {
    body: Box<dyn BodySource>,
    kind: BodyKind,
    /// Headers for the backend PUT (already filtered).
    headers: HeaderMap,
}

/// Resolve the `X-Copy-From` source into a body and merged header set.
async fn open_copy_source(
    app: &Application,
    req: &ClientRequest,
    source: &str,
) -> Result<PutSource, ProxyResponse> {
    let Some((src_container, src_object)) = parse_cross_ref(source) else {
        return Err(text_response(
            StatusCode::PRECONDITION_FAILED,
            &req.trans_id,
            "X-Copy-From header must be of the form <container name>/<object name>",
        ));
    };
    let mut head = RequestHead::new(
        Method::GET,
        format!("/{}/{}/{}", req.account, src_container, src_object),
    );
    head.headers = base::backend_headers(req);
    let (part, mut nodes) = app.object_iter(&req.account, &src_container, &src_object);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            req.wants_newest(),
            app.object_ring.replica_count(),
        )
        .await;
    let stream = match outcome {
        ReadOutcome::Stream(stream) => stream,
        ReadOutcome::Error(best) => {
            return Err(base::best_to_response(&best, &req.trans_id, false))
        }
    };

    // Merge: source supplies content headers and metadata; the copy request
    // overrides content-type and replaces metadata wholesale when it carries
    // any of its own.
    let mut merged = object_write_headers(&stream.head.headers, &app.config.allowed_headers);
    let client_has_meta = req
        .headers
        .keys()
        .any(|name| name.as_str().starts_with(Resource::Object.meta_prefix()));
    if client_has_meta {
        let stale: Vec<_> = merged
            .keys()
            .filter(|name| name.as_str().starts_with(Resource::Object.meta_prefix()))
            .cloned()
            .collect();
        for name in stale {
            merged.remove(&name);
        }
    }
    for (name, value) in object_write_headers(&req.headers, &app.config.allowed_headers) {
        if let Some(name) = name {
            merged.insert(name, value.clone());
        }
    }

    if let Some(manifest) = stream.head.header("x-object-manifest").map(str::to_string) {
        // Copying a manifest consolidates its segments into a real object.
        // The pointer's own etag describes its empty body, not the composite.
        merged.remove("x-object-manifest");
        merged.remove("etag");
        match large_object::consolidated_source(app, req, &manifest).await {
            Ok(consolidated) => {
                if consolidated.total > MAX_FILE_SIZE {
                    return Err(text_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        &req.trans_id,
                        "Copy source too large",
                    ));
                }
                return Ok(PutSource {
                    body: Box::new(consolidated.walker),
                    kind: BodyKind::Sized(consolidated.total),
                    headers: merged,
                });
            }
            Err(ConsolidateError::TooManySegments) => {
                return Err(text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &req.trans_id,
                    "Copy source has too many segments",
                ))
            }
            Err(ConsolidateError::Listing(status)) => {
                return Err(text_response(status, &req.trans_id, "Copy source unreadable"))
            }
        }
    }

    let kind = match stream.head.content_length() {
        Some(n) if n > MAX_FILE_SIZE => {
            return Err(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &req.trans_id,
                "Copy source too large",
            ))
        }
        Some(n) => BodyKind::Sized(n),
        None => BodyKind::Chunked,
    };
    Ok(PutSource {
        body: Box::new(StreamedBody::new(stream, app.replicator.node_timeout())),
        kind,
        headers: merged,
    })
}

async fn put(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    // Validation rejects before any backend traffic.
    fold_remove_headers(&mut req.headers, Resource::Object);
    if let Err(violation) = check_metadata(&req.headers, Resource::Object) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }
    if let Err((status, message)) = convert_delete_headers(app, &mut req.headers) {
        return Ok(text_response(status, &req.trans_id, &message));
    }
    if !req.headers.contains_key("content-type") {
        req.headers
            .insert("content-type", HeaderValue::from_static("application/octet-stream"));
    }
    let (container, object) = names(&req);
    if let Err(violation) = check_object_creation(&req.headers, &object) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }

    let cinfo = match resolve_container(app, &req).await {
        Ok(info) => info,
        Err(resp) => return Ok(resp),
    };
    if let Some(denied) = base::authorize(&req, cinfo.write_acl.as_deref()) {
        return Ok(denied);
    }

    let copy_from = req.header("x-copy-from").map(str::to_string);
    let source = if let Some(copy_from) = copy_from {
        match open_copy_source(app, &req, &copy_from).await {
            Ok(source) => Some(source),
            Err(resp) => return Ok(resp),
        }
    } else {
        None
    };

    // Client-body PUTs must declare a length or stream chunked.
    let client_kind = match req.header("content-length") {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) => BodyKind::Sized(n),
            Err(_) => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    &req.trans_id,
                    "Invalid Content-Length",
                ))
            }
        },
        None => {
            let chunked = req
                .header("transfer-encoding")
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false);
            if source.is_none() && !chunked {
                return Ok(text_response(
                    StatusCode::LENGTH_REQUIRED,
                    &req.trans_id,
                    "Missing Content-Length",
                ));
            }
            BodyKind::Chunked
        }
    };

    if let Some(versions_container) = cinfo.versions_location.as_deref() {
        if let Err(resp) = versioned::archive_before_put(app, &req, versions_container).await {
            return Ok(resp);
        }
    }

    let mut head = RequestHead::new(
        Method::PUT,
        format!("/{}/{}/{}", req.account, container, object),
    );
    let (mut body, kind, write_headers): (Box<dyn BodySource>, BodyKind, HeaderMap) =
        match source {
            Some(put_source) => (put_source.body, put_source.kind, put_source.headers),
            None => {
                let body = std::mem::replace(
                    &mut req.body,
                    Box::new(crate::replicate::BufferedBody::new(bytes::Bytes::new())),
                );
                (
                    body,
                    client_kind,
                    object_write_headers(&req.headers, &app.config.allowed_headers),
                )
            }
        };
    head.headers = write_headers;
    let common = base::backend_headers(&req);
    for (name, value) in &common {
        head.headers.insert(name.clone(), value.clone());
    }
    base::stamp(&mut head.headers, app);
    head.body = kind;

    let (part, mut nodes) = app.object_iter(&req.account, &container, &object);
    let (collected, agreed) = app
        .replicator
        .stream_put(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            body.as_mut(),
            app.object_ring.replica_count(),
        )
        .await?;
    let best = best_response(&collected, agreed);
    Ok(base::best_to_response(&best, &req.trans_id, true))
}

async fn post(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    fold_remove_headers(&mut req.headers, Resource::Object);
    if let Err(violation) = check_metadata(&req.headers, Resource::Object) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }
    if let Err((status, message)) = convert_delete_headers(app, &mut req.headers) {
        return Ok(text_response(status, &req.trans_id, &message));
    }
    let cinfo = match resolve_container(app, &req).await {
        Ok(info) => info,
        Err(resp) => return Ok(resp),
    };
    if let Some(denied) = base::authorize(&req, cinfo.write_acl.as_deref()) {
        return Ok(denied);
    }

    let (container, object) = names(&req);
    if app.config.object_post_as_copy {
        // Rewrite the object onto itself so metadata is fully replaced even
        // on backends that store POST as a diff.
        let source = format!("{container}/{object}");
        let put_source = match open_copy_source(app, &req, &source).await {
            Ok(source) => source,
            Err(resp) => return Ok(resp),
        };
        let mut head = RequestHead::new(
            Method::PUT,
            format!("/{}/{}/{}", req.account, container, object),
        );
        head.headers = put_source.headers;
        let common = base::backend_headers(&req);
        for (name, value) in &common {
            head.headers.insert(name.clone(), value.clone());
        }
        base::stamp(&mut head.headers, app);
        head.body = put_source.kind;
        let mut body = put_source.body;
        let (part, mut nodes) = app.object_iter(&req.account, &container, &object);
        let (collected, agreed) = app
            .replicator
            .stream_put(
                &mut nodes,
                &app.object_limiter,
                part,
                &head,
                body.as_mut(),
                app.object_ring.replica_count(),
            )
            .await?;
        let best = best_response(&collected, agreed);
        return Ok(base::best_to_response(&best, &req.trans_id, true));
    }

    let mut head = RequestHead::new(
        Method::POST,
        format!("/{}/{}/{}", req.account, container, object),
    );
    head.headers = object_write_headers(&req.headers, &app.config.allowed_headers);
    let common = base::backend_headers(&req);
    for (name, value) in &common {
        head.headers.insert(name.clone(), value.clone());
    }
    base::stamp(&mut head.headers, app);
    let (part, mut nodes) = app.object_iter(&req.account, &container, &object);
    let collected = app
        .replicator
        .make_requests(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            app.object_ring.replica_count(),
        )
        .await;
    let best = best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}

async fn delete(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let cinfo = match resolve_container(app, &req).await {
        Ok(info) => info,
        Err(resp) => return Ok(resp),
    };
    if let Some(denied) = base::authorize(&req, cinfo.write_acl.as_deref()) {
        return Ok(denied);
    }

    if let Some(versions_container) = cinfo.versions_location.as_deref() {
        if let Some(resp) = versioned::restore_on_delete(app, &req, versions_container).await? {
            return Ok(resp);
        }
        // No archived versions: fall through to a real delete.
    }

    let (container, object) = names(&req);
    let mut head = RequestHead::new(
        Method::DELETE,
        format!("/{}/{}/{}", req.account, container, object),
    );
    head.headers = base::backend_headers(&req);
    base::stamp(&mut head.headers, app);
    let (part, mut nodes) = app.object_iter(&req.account, &container, &object);
    let collected = app
        .replicator
        .make_requests(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            app.object_ring.replica_count(),
        )
        .await;
    let best = best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}

async fn copy(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let Some(destination) = req.header("destination").map(str::to_string) else {
        return Ok(text_response(
            StatusCode::PRECONDITION_FAILED,
            &req.trans_id,
            "Destination header required",
        ));
    };
    let Some((dest_container, dest_object)) = parse_cross_ref(&destination) else {
        return Ok(text_response(
            StatusCode::PRECONDITION_FAILED,
            &req.trans_id,
            "Destination header must be of the form <container name>/<object name>",
        ));
    };
    let (src_container, src_object) = names(&req);
    let source = format!("{src_container}/{src_object}");
    if let Ok(value) = HeaderValue::from_str(&source) {
        req.headers.insert("x-copy-from", value);
    }
    req.headers.remove("destination");
    req.container = Some(dest_container);
    req.object = Some(dest_object);
    req.method = Method::PUT;
    put(app, req).await
}
