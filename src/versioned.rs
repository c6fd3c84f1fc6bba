//! Object versioning: archive-on-overwrite, restore-on-delete.
//!
//! A container with `X-Versions-Location: <archive>` gets its object
//! overwrites preceded by a copy of the live object into the archive
//! container, under `{:03x}{name}/{inverse-timestamp}` so a prefix listing
//! returns versions newest-first. DELETE pops the newest archived version
//! back over the live name. Concurrent versioned writes to one object are
//! serialized with an advisory soft lock; the lock fails open, degrading to
//! last-writer-wins.

use crate::app::Application;
use crate::controllers::base;
use crate::controllers::{text_response, ClientRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::headers::object_write_headers;
use crate::large_object::SegmentSpec;
use crate::replicate::{best_response, ReadOutcome, StreamedBody};
use crate::timestamp::Timestamp;
use crate::transport::{BodyKind, RequestHead, ResponseHead};
use http::{Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::Duration;

const QUERY_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

const VERSION_LOCK_TTL: Duration = Duration::from_secs(10);
const VERSION_LOCK_RETRIES: u32 = 5;

/// Archive-name prefix for one object: `{:03x}{name}/`.
pub fn version_prefix(object: &str) -> String {
    format!("{:03x}{}/", object.len(), object)
}

/// Full archive entry name for a live object stamped `ts`.
pub fn version_name(object: &str, ts: Timestamp) -> String {
    format!("{}{}", version_prefix(object), ts.inverse())
}

fn lock_key(req: &ClientRequest) -> String {
    format!(
        "versions/{}/{}/{}",
        req.account,
        req.container.as_deref().unwrap_or(""),
        req.object.as_deref().unwrap_or("")
    )
}

async fn soft_serialize(app: &Application, req: &ClientRequest) -> Option<crate::cache::SoftLock> {
    match app.cache.soft_lock(&lock_key(req), VERSION_LOCK_TTL, VERSION_LOCK_RETRIES).await {
        Ok(lock) => Some(lock),
        Err(err) => {
            tracing::warn!(error = %err, "versioning proceeding without lock");
            None
        }
    }
}

/// Fetch the live object; `None` when it does not exist.
async fn fetch_live(
    app: &Application,
    req: &ClientRequest,
) -> Result<Option<crate::replicate::StreamingResponse>, ProxyError> {
    let container = req.container.as_deref().unwrap_or_default();
    let object = req.object.as_deref().unwrap_or_default();
    let mut head = RequestHead::new(
        Method::GET,
        format!("/{}/{}/{}", req.account, container, object),
    );
    head.headers = base::backend_headers(req);
    let (part, mut nodes) = app.object_iter(&req.account, container, object);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            false,
            app.object_ring.replica_count(),
        )
        .await;
    match outcome {
        ReadOutcome::Stream(stream) => Ok(Some(stream)),
        ReadOutcome::Error(_) => Ok(None),
    }
}

/// Replicated PUT of a backend response body to `container/object`.
async fn copy_into(
    app: &Application,
    req: &ClientRequest,
    container: &str,
    object: &str,
    source_head: &ResponseHead,
    source: crate::replicate::StreamingResponse,
) -> Result<StatusCode, ProxyError> {
    let mut head = RequestHead::new(
        Method::PUT,
        format!("/{}/{}/{}", req.account, container, object),
    );
    head.headers = object_write_headers(&source_head.headers, &app.config.allowed_headers);
    let common = base::backend_headers(req);
    for (name, value) in &common {
        head.headers.insert(name.clone(), value.clone());
    }
    base::stamp(&mut head.headers, app);
    head.body = match source_head.content_length() {
        Some(n) => BodyKind::Sized(n),
        None => BodyKind::Chunked,
    };

    let mut body = StreamedBody::new(source, app.replicator.node_timeout());
    let (part, mut nodes) = app.object_iter(&req.account, container, object);
    let (collected, agreed) = app
        .replicator
        .stream_put(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            &mut body,
            app.object_ring.replica_count(),
        )
        .await?;
    Ok(best_response(&collected, agreed).status)
}

/// Before an overwriting PUT: copy the live object into the archive
/// container. `Err` carries the response that should short-circuit the PUT.
pub async fn archive_before_put(
    app: &Application,
    req: &ClientRequest,
    versions_container: &str,
) -> Result<(), ProxyResponse> {
    let lock = soft_serialize(app, req).await;
    let result = archive_inner(app, req, versions_container).await;
    if let Some(lock) = lock {
        lock.release().await;
    }
    result
}

async fn archive_inner(
    app: &Application,
    req: &ClientRequest,
    versions_container: &str,
) -> Result<(), ProxyResponse> {
    let live = match fetch_live(app, req).await {
        Ok(live) => live,
        Err(err) => {
            return Err(text_response(err.status(), &req.trans_id, &err.to_string()))
        }
    };
    let Some(live) = live else {
        return Ok(());
    };
    if live.head.header("x-object-manifest").is_some() {
        // Manifests are pointers; archiving one would version the pointer,
        // not the data.
        return Ok(());
    }

    let archive_info = base::container_info(app, req, &req.account, versions_container).await;
    if !archive_info.exists() {
        return Err(text_response(
            StatusCode::PRECONDITION_FAILED,
            &req.trans_id,
            "Versions container does not exist",
        ));
    }

    let object = req.object.as_deref().unwrap_or_default();
    let ts = live.head.timestamp().unwrap_or_else(|| app.issuer.next());
    let archive_name = version_name(object, ts);
    let source_head = live.head.clone();
    match copy_into(app, req, versions_container, &archive_name, &source_head, live).await {
        Ok(status) if status.is_success() => {
            tracing::debug!(archive = %archive_name, "archived object version");
            Ok(())
        }
        Ok(status) => Err(text_response(status, &req.trans_id, "Version archiving failed")),
        Err(err) => Err(text_response(err.status(), &req.trans_id, &err.to_string())),
    }
}

/// Newest archived entry for an object, if any.
async fn newest_version(
    app: &Application,
    req: &ClientRequest,
    versions_container: &str,
) -> Result<Option<SegmentSpec>, ProxyError> {
    let prefix = version_prefix(req.object.as_deref().unwrap_or_default());
    let mut head = RequestHead::new(
        Method::GET,
        format!("/{}/{}", req.account, versions_container),
    );
    head.headers = base::backend_headers(req);
    head.query = Some(format!(
        "format=json&limit=1&prefix={}",
        utf8_percent_encode(&prefix, QUERY_KEEP)
    ));
    let (part, mut nodes) = app.container_iter(&req.account, versions_container);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.container_limiter,
            part,
            &head,
            false,
            app.container_ring.replica_count(),
        )
        .await;
    match outcome {
        ReadOutcome::Stream(mut stream) => {
            let body = app
                .replicator
                .buffer_stream(&mut stream)
                .await
                .map_err(ProxyError::Transport)?;
            if stream.head.status == StatusCode::NO_CONTENT || body.is_empty() {
                return Ok(None);
            }
            let mut entries: Vec<SegmentSpec> = serde_json::from_slice(&body)
                .map_err(|e| ProxyError::Manifest(format!("bad version listing: {e}")))?;
            Ok(if entries.is_empty() { None } else { Some(entries.remove(0)) })
        }
        ReadOutcome::Error(_) => Ok(None),
    }
}

/// Versioned DELETE: restore the newest archived version over the live name,
/// then drop it from the archive. With no archived versions, fall through to
/// a plain replicated delete (`Ok(None)`).
pub async fn restore_on_delete(
    app: &Application,
    req: &ClientRequest,
    versions_container: &str,
) -> Result<Option<ProxyResponse>, ProxyError> {
    let lock = soft_serialize(app, req).await;
    let result = restore_inner(app, req, versions_container).await;
    if let Some(lock) = lock {
        lock.release().await;
    }
    result
}

async fn restore_inner(
    app: &Application,
    req: &ClientRequest,
    versions_container: &str,
) -> Result<Option<ProxyResponse>, ProxyError> {
    let Some(entry) = newest_version(app, req, versions_container).await? else {
        return Ok(None);
    };

    // Fetch the archived entry.
    let mut head = RequestHead::new(
        Method::GET,
        format!("/{}/{}/{}", req.account, versions_container, entry.name),
    );
    head.headers = base::backend_headers(req);
    let (part, mut nodes) = app.object_iter(&req.account, versions_container, &entry.name);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.object_limiter,
            part,
            &head,
            false,
            app.object_ring.replica_count(),
        )
        .await;
    let archived = match outcome {
        ReadOutcome::Stream(stream) => stream,
        ReadOutcome::Error(best) => {
            return Ok(Some(text_response(
                best.status,
                &req.trans_id,
                "Archived version unreadable",
            )))
        }
    };

    // Copy it back over the live name.
    let container = req.container.as_deref().unwrap_or_default();
    let object = req.object.as_deref().unwrap_or_default();
    let source_head = archived.head.clone();
    let status =
        copy_into(app, req, container, object, &source_head, archived).await?;
    if !status.is_success() {
        return Ok(Some(text_response(status, &req.trans_id, "Version restore failed")));
    }

    // Drop the restored entry from the archive.
    let mut del = RequestHead::new(
        Method::DELETE,
        format!("/{}/{}/{}", req.account, versions_container, entry.name),
    );
    del.headers = base::backend_headers(req);
    base::stamp(&mut del.headers, app);
    let (part, mut nodes) = app.object_iter(&req.account, versions_container, &entry.name);
    let collected = app
        .replicator
        .make_requests(
            &mut nodes,
            &app.object_limiter,
            part,
            &del,
            app.object_ring.replica_count(),
        )
        .await;
    let best = best_response(&collected, None);
    if !best.status.is_success() {
        tracing::warn!(entry = %entry.name, status = best.status.as_u16(),
            "restored version left in archive");
    }
    Ok(Some(text_response(StatusCode::OK, &req.trans_id, "")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_prefix_is_hex_length_padded() {
        assert_eq!(version_prefix("name"), "004name/");
        assert_eq!(version_prefix(&"x".repeat(26)), format!("01a{}/", "x".repeat(26)));
    }

    #[test]
    fn version_names_sort_newest_first() {
        let older = Timestamp::from_micros(1_000_000_000_000_000);
        let newer = Timestamp::from_micros(1_000_000_005_000_000);
        let a = version_name("name", older);
        let b = version_name("name", newer);
        assert!(b < a);
        assert!(a.starts_with("004name/"));
        assert!(b.starts_with("004name/"));
    }
}
