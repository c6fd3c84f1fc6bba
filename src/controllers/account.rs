//! Account verb handlers.

use crate::app::Application;
use crate::constraints::{check_metadata, Resource, MAX_ACCOUNT_NAME_LENGTH};
use crate::controllers::base;
use crate::controllers::{text_response, ClientRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::headers::fold_remove_headers;
use crate::replicate::ReadOutcome;
use crate::transport::RequestHead;
use http::StatusCode;

pub async fn handle(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    match req.method.as_str() {
        "GET" | "HEAD" => get_or_head(app, req).await,
        _ => {
            if !app.config.allow_account_management {
                return Ok(text_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    &req.trans_id,
                    "Method Not Allowed",
                ));
            }
            mutate(app, req).await
        }
    }
}

async fn get_or_head(app: &Application, req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    if let Some(denied) = base::authorize(&req, None) {
        return Ok(denied);
    }
    let outcome = read_once(app, &req).await;
    match outcome {
        ReadOutcome::Stream(stream) => {
            Ok(base::streamed_response(app, stream, &req.trans_id, req.method == http::Method::HEAD))
        }
        ReadOutcome::Error(best) if best.status == StatusCode::NOT_FOUND
            && app.config.account_autocreate =>
        {
            let created = base::create_account(app, &req, &req.account).await;
            if !created.status.is_success() {
                tracing::info!(account = %req.account, status = created.status.as_u16(),
                    "account autocreate refused");
                return Ok(base::best_to_response(&created, &req.trans_id, false));
            }
            tracing::info!(account = %req.account, "account autocreated");
            match read_once(app, &req).await {
                ReadOutcome::Stream(stream) => Ok(base::streamed_response(
                    app,
                    stream,
                    &req.trans_id,
                    req.method == http::Method::HEAD,
                )),
                ReadOutcome::Error(best) => {
                    Ok(base::best_to_response(&best, &req.trans_id, false))
                }
            }
        }
        ReadOutcome::Error(best) => Ok(base::best_to_response(&best, &req.trans_id, false)),
    }
}

async fn read_once(app: &Application, req: &ClientRequest) -> ReadOutcome {
    let mut head = RequestHead::new(req.method.clone(), format!("/{}", req.account));
    head.headers = base::backend_headers(req);
    if let Some(query) = &req.query {
        head.query = Some(query.clone());
    }
    let (part, mut nodes) = app.account_iter(&req.account);
    app.replicator
        .read(
            &mut nodes,
            &app.account_limiter,
            part,
            &head,
            req.wants_newest(),
            app.account_ring.replica_count(),
        )
        .await
}

async fn mutate(app: &Application, mut req: ClientRequest) -> Result<ProxyResponse, ProxyError> {
    if req.method == http::Method::PUT && req.account.len() > MAX_ACCOUNT_NAME_LENGTH {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            &req.trans_id,
            &format!(
                "Account name length of {} longer than {MAX_ACCOUNT_NAME_LENGTH}",
                req.account.len()
            ),
        ));
    }
    fold_remove_headers(&mut req.headers, Resource::Account);
    if let Err(violation) = check_metadata(&req.headers, Resource::Account) {
        return Ok(text_response(violation.status, &req.trans_id, &violation.message));
    }
    if let Some(denied) = base::authorize(&req, None) {
        return Ok(denied);
    }

    let mut head = RequestHead::new(req.method.clone(), format!("/{}", req.account));
    head.headers = base::backend_headers(&req);
    base::stamp(&mut head.headers, app);
    for (name, value) in &req.headers {
        if name.as_str().starts_with(Resource::Account.meta_prefix()) {
            head.headers.append(name.clone(), value.clone());
        }
    }

    let (part, mut nodes) = app.account_iter(&req.account);
    let replicas = app.account_ring.replica_count();
    let collected = app
        .replicator
        .make_requests(&mut nodes, &app.account_limiter, part, &head, replicas)
        .await;
    app.cache.purge_account(&req.account).await;
    let best = crate::replicate::best_response(&collected, None);
    Ok(base::best_to_response(&best, &req.trans_id, false))
}
