//! Container verb handlers.

use crate::acl::clean_acl;
use crate::app::Application;
use crate::constraints::{check_metadata, Resource, MAX_CONTAINER_NAME_LENGTH};
use crate::controllers::base;
use crate::controllers::{text_response, ClientRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::headers::fold_remove_headers;
use crate::replicate::{best_response, ReadOutcome};
use crate::transport::RequestHead;
use http::header::HeaderValue;
use http::{Method, StatusCode};
use std::time::Duration;

/// Soft-lock window around container creation; long enough to cover the
/// replicated PUT, short enough to self-heal fast if a proxy dies mid-create.
const CREATE_LOCK_TTL: Duration = Duration::from_secs(10);
const CREATE_LOCK_RETRIES: u32 = 10;

pub async fn handle(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    match req.method.as_str() {
        "GET" | "HEAD" => get_or_head(app, req).await,
        "PUT" => put(app, req).await,
        "POST" => post(app, req).await,
        "DELETE" => delete(app, req).await,
        _ => Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &req.trans_id,
            "Method Not Allowed",
        )),
    }
}

fn container_name(req: &ClientRequest) -> String {
    req.container.clone().unwrap_or_default()
}

async fn get_or_head(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let container = container_name(&req);
    let cached = app.cache.container(&req.account, &container).await;
    let read_acl = cached.as_ref().and_then(|info| info.read_acl.clone());
    if let Some(denied) = base::authorize(&req, read_acl.as_deref()) {
        return Ok(denied);
    }

    let mut head =
        RequestHead::new(req.method.clone(), format!("/{}/{}", req.account, container));
    head.headers = base::backend_headers(&req);
    if let Some(query) = &req.query {
        head.query = Some(query.clone());
    }
    let (part, mut nodes) = app.container_iter(&req.account, &container);
    let outcome = app
        .replicator
        .read(
            &mut nodes,
            &app.container_limiter,
            part,
            &head,
            req.wants_newest(),
            app.container_ring.replica_count(),
        )
        .await;
    match outcome {
        ReadOutcome::Stream(stream) => {
            let info = base::container_info_from_headers(
                stream.head.status.as_u16(),
                &stream.head.headers,
            );
            app.cache
                .set_container(&req.account, &container, &info, app.config.container_ttl())
                .await;
            Ok(base::streamed_response(app, stream, &req.trans_id, req.method == Method::HEAD))
        }
        ReadOutcome::Error(best) => {
            let info = base::container_info_from_headers(best.status.as_u16(), &best.headers);
            app.cache
                .set_container(&req.account, &container, &info, app.config.container_ttl())
                .await;
            Ok(base::best_to_response(&best, &req.trans_id, false))
        }
    }
}

/// Validate ACL headers in place, normalizing their values.
fn clean_acl_headers(req: &mut ClientRequest) -> Result<(), String> {
    for name in ["x-container-read", "x-container-write"] {
        let Some(raw) = req.header(name).map(str::to_string) else {
            continue;
        };
        let cleaned = clean_acl(name, &raw).map_err(|err| err.to_string())?;
        if let Ok(value) = HeaderValue::from_str(&cleaned) {
            req.headers.insert(name, value);
        }
    }
    Ok(())
}

fn versions_check(app: &Application, req: &ClientRequest) -> Option<ProxyResponse> {
    let value = req.header("x-versions-location")?;
    if value.is_empty() {
        // Empty clears the attribute; always allowed.
        return None;
    }
    if !app.config.allow_versions {
        return Some(text_response(
            StatusCode::PRECONDITION_FAILED,
            &req.trans_id,
            "Versioned Writes is disabled",
        ));
    }
    if value.contains('/') {
        return Some(text_response(
            StatusCode::BAD_REQUEST,
            &req.trans_id,
            "X-Versions-Location must name a container",
        ));
    }
    None
}

async fn put(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let container = container_name(&req);
    if container.len() > MAX_CONTAINER_NAME_LENGTH {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            &req.trans_id,
            &format!(
                "Container name length of {} longer than {MAX_CONTAINER_NAME_LENGTH}",
                container.len()
            ),
        ));
    }
    fold_remove_headers(&mut req.headers, Resource::Container);
    if let Err(violation) = check_metadata(&req.headers, Resource::Container) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }
    if let Err(message) = clean_acl_headers(&mut req) {
        return Ok(text_response(StatusCode::BAD_REQUEST, &req.trans_id, &message));
    }
    if let Some(resp) = versions_check(app, &req) {
        return Ok(resp);
    }
    if let Some(denied) = base::authorize(&req, None) {
        return Ok(denied);
    }

    let account_info = base::account_info(app, &req, &req.account).await;
    let account_info = if account_info.exists() {
        account_info
    } else if app.config.account_autocreate {
        let created = base::create_account(app, &req, &req.account).await;
        if !created.status.is_success() {
            tracing::info!(account = %req.account, status = created.status.as_u16(),
                "account autocreate for container PUT refused");
            return Ok(base::not_found(&req.trans_id));
        }
        crate::cache::AccountInfo { status: created.status.as_u16(), ..Default::default() }
    } else {
        return Ok(base::not_found(&req.trans_id));
    };

    let limit = app.config.max_containers_per_account;
    if limit > 0
        && account_info.container_count >= limit as u64
        && !app.config.max_containers_whitelist.iter().any(|a| a == &req.account)
    {
        return Ok(text_response(
            StatusCode::FORBIDDEN,
            &req.trans_id,
            &format!("Reached container limit of {limit}"),
        ));
    }

    // Collapse concurrent creates of the same container across proxies. The
    // lock is advisory: sustained contention proceeds anyway.
    let lock_key = crate::cache::LookupCache::container_key(&req.account, &container);
    let lock = match app
        .cache
        .soft_lock(&lock_key, CREATE_LOCK_TTL, CREATE_LOCK_RETRIES)
        .await
    {
        Ok(lock) => Some(lock),
        Err(err) => {
            tracing::warn!(error = %err, "container create proceeding without lock");
            None
        }
    };

    let mut head =
        RequestHead::new(Method::PUT, format!("/{}/{}", req.account, container));
    head.headers = base::backend_headers(&req);
    base::stamp(&mut head.headers, app);
    copy_container_headers(&req, &mut head);

    let (part, mut nodes) = app.container_iter(&req.account, &container);
    let replicas = app.container_ring.replica_count();
    let collected = app
        .replicator
        .make_requests(&mut nodes, &app.container_limiter, part, &head, replicas)
        .await;
    app.cache.purge_container(&req.account, &container).await;
    if let Some(lock) = lock {
        lock.release().await;
    }
    let best = best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}

async fn post(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let container = container_name(&req);
    fold_remove_headers(&mut req.headers, Resource::Container);
    if let Err(violation) = check_metadata(&req.headers, Resource::Container) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }
    if let Err(message) = clean_acl_headers(&mut req) {
        return Ok(text_response(StatusCode::BAD_REQUEST, &req.trans_id, &message));
    }
    if let Some(resp) = versions_check(app, &req) {
        return Ok(resp);
    }
    let cached = app.cache.container(&req.account, &container).await;
    let write_acl = cached.as_ref().and_then(|info| info.write_acl.clone());
    if let Some(denied) = base::authorize(&req, write_acl.as_deref()) {
        return Ok(denied);
    }
    if !base::account_info(app, &req, &req.account).await.exists() {
        return Ok(base::not_found(&req.trans_id));
    }

    let mut head =
        RequestHead::new(Method::POST, format!("/{}/{}", req.account, container));
    head.headers = base::backend_headers(&req);
    base::stamp(&mut head.headers, app);
    copy_container_headers(&req, &mut head);

    let (part, mut nodes) = app.container_iter(&req.account, &container);
    let replicas = app.container_ring.replica_count();
    let collected = app
        .replicator
        .make_requests(&mut nodes, &app.container_limiter, part, &head, replicas)
        .await;
    app.cache.purge_container(&req.account, &container).await;
    let best = best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}

async fn delete(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    let container = container_name(&req);
    let cached = app.cache.container(&req.account, &container).await;
    let write_acl = cached.as_ref().and_then(|info| info.write_acl.clone());
    if let Some(denied) = base::authorize(&req, write_acl.as_deref()) {
        return Ok(denied);
    }
    if !base::account_info(app, &req, &req.account).await.exists() {
        return Ok(base::not_found(&req.trans_id));
    }

    let mut head =
        RequestHead::new(Method::DELETE, format!("/{}/{}", req.account, container));
    head.headers = base::backend_headers(&req);
    base::stamp(&mut head.headers, app);

    let (part, mut nodes) = app.container_iter(&req.account, &container);
    let replicas = app.container_ring.replica_count();
    let collected = app
        .replicator
        .make_requests(&mut nodes, &app.container_limiter, part, &head, replicas)
        .await;
    app.cache.purge_container(&req.account, &container).await;
    // A non-empty container surfaces the backend 409 through best_response.
    let best = best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}

/// Container attributes forwarded on PUT/POST: user metadata, ACLs, the
/// versions attribute, and sync keys.
fn copy_container_headers(req: &ClientRequest, head: &mut RequestHead) {
    for (name, value) in &req.headers {
        let key = name.as_str();
        let pass = key.starts_with(Resource::Container.meta_prefix())
            || matches!(
                key,
                "x-container-read"
                    | "x-container-write"
                    | "x-versions-location"
                    | "x-container-sync-key"
                    | "x-container-sync-to"
            );
        if pass {
            head.headers.append(name.clone(), value.clone());
        }
    }
}
