//! Replicated dispatch status matrices: which backend status combinations
//! yield which client responses.

mod common;

use bytes::Bytes;
use common::{build_app, scripts, Script, ScriptedTransport, TestApp};
use http::StatusCode;
use magpie::ProxyConfig;
use std::sync::Arc;

/// Scripted tests pin node order by disabling handoffs, the way a two-node
/// development ring behaves.
fn scripted_config() -> ProxyConfig {
    ProxyConfig { max_handoffs: Some(0), ..ProxyConfig::default() }
}

fn scripted_app(codes: &[i32]) -> (TestApp, Arc<ScriptedTransport>) {
    let transport = ScriptedTransport::new(scripts(codes));
    (build_app(scripted_config(), transport.clone()), transport)
}

async fn object_put_status(codes: &[i32]) -> StatusCode {
    let (app, _t) = scripted_app(codes);
    let (status, _, _) = app
        .request("PUT", "/v1/a/c/o.jpg", &[("content-length", "0")], b"")
        .await;
    status
}

async fn object_delete_status(codes: &[i32]) -> StatusCode {
    let (app, _t) = scripted_app(codes);
    let (status, _, _) = app.request("DELETE", "/v1/a/c/o", &[], b"").await;
    status
}

async fn object_head_status(codes: &[i32]) -> StatusCode {
    let (app, _t) = scripted_app(codes);
    let (status, _, _) = app.request("HEAD", "/v1/a/c/o", &[], b"").await;
    status
}

// The leading 200 in every script answers the container existence check; the
// remainder are the three object replicas.

#[tokio::test]
async fn put_succeeds_on_full_and_partial_success() {
    assert_eq!(object_put_status(&[200, 201, 201, 201]).await, 201);
    assert_eq!(object_put_status(&[200, 201, 201, 500]).await, 201);
}

#[tokio::test]
async fn put_surfaces_majority_client_error() {
    assert_eq!(object_put_status(&[200, 204, 404, 404]).await, 404);
}

#[tokio::test]
async fn put_without_majority_is_unavailable() {
    assert_eq!(object_put_status(&[200, 204, 500, 404]).await, 503);
}

#[tokio::test]
async fn put_tolerates_one_connect_failure() {
    assert_eq!(object_put_status(&[200, 201, 201, -1]).await, 201);
    assert_eq!(object_put_status(&[200, 201, 201, -2]).await, 201);
    assert_eq!(object_put_status(&[200, 201, 201, -3]).await, 201);
}

#[tokio::test]
async fn put_below_write_quorum_is_unavailable() {
    assert_eq!(object_put_status(&[200, 201, -1, -1]).await, 503);
    assert_eq!(object_put_status(&[200, 503, 503, -1]).await, 503);
}

#[tokio::test]
async fn delete_status_matrix() {
    assert_eq!(object_delete_status(&[200, 204, 204, 204]).await, 204);
    assert_eq!(object_delete_status(&[200, 204, 204, 500]).await, 204);
    assert_eq!(object_delete_status(&[200, 204, 404, 404]).await, 404);
    assert_eq!(object_delete_status(&[200, 204, 500, 404]).await, 503);
    assert_eq!(object_delete_status(&[200, 404, 404, 404]).await, 404);
    assert_eq!(object_delete_status(&[200, 404, 404, 500]).await, 404);
}

#[tokio::test]
async fn head_first_good_node_wins() {
    assert_eq!(object_head_status(&[200, 200, 404, 404]).await, 200);
    assert_eq!(object_head_status(&[200, 200, 500, 404]).await, 200);
    assert_eq!(object_head_status(&[200, 304, 500, 404]).await, 304);
    assert_eq!(object_head_status(&[200, 404, 404, 404]).await, 404);
    assert_eq!(object_head_status(&[200, 404, 404, 500]).await, 404);
    assert_eq!(object_head_status(&[200, 500, 500, 500]).await, 503);
}

#[tokio::test]
async fn newest_read_waits_for_all_and_takes_highest_timestamp() {
    for (stamps, expected) in [
        (["1", "2", "3"], "3"),
        (["1", "3", "2"], "3"),
        (["3", "3", "1"], "3"),
    ] {
        let mut all = vec![Script::status(200)];
        for ts in stamps {
            all.push(Script::status(200).timestamp(Some(ts)).body(b"x"));
        }
        let transport = ScriptedTransport::new(all);
        let app = build_app(scripted_config(), transport);
        let (status, headers, _) = app
            .request("GET", "/v1/a/c/o", &[("x-newest", "true")], b"")
            .await;
        assert_eq!(status, 200);
        assert_eq!(
            headers.get("last-modified").and_then(|v| v.to_str().ok()),
            Some(expected)
        );
    }
}

#[tokio::test]
async fn newest_read_tolerates_missing_timestamps() {
    let mut all = vec![Script::status(200)];
    all.push(Script::status(200).timestamp(None));
    all.push(Script::status(200).timestamp(None));
    all.push(Script::status(200).timestamp(Some("1")));
    let transport = ScriptedTransport::new(all);
    let app = build_app(scripted_config(), transport);
    let (status, headers, _) = app
        .request("GET", "/v1/a/c/o", &[("x-newest", "true")], b"")
        .await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("last-modified").and_then(|v| v.to_str().ok()), Some("1"));
}

#[tokio::test]
async fn disagreeing_write_etags_are_a_server_error() {
    let all = vec![
        Script::status(200),
        Script::status(201).etag(Some("68b329da9893e34099c7d8ad5cb9c940")),
        Script::status(201).etag(Some("68b329da9893e34099c7d8ad5cb9c940")),
        Script::status(201).etag(Some("68b329da9893e34099c7d8ad5cb9c941")),
    ];
    let transport = ScriptedTransport::new(all);
    let app = build_app(scripted_config(), transport);
    let (status, _, _) = app
        .request("PUT", "/v1/a/c/o", &[("content-length", "0")], b"")
        .await;
    assert!(status.is_server_error());
}

#[tokio::test]
async fn client_etag_mismatch_majority_surfaces_422() {
    let all = vec![
        Script::status(200),
        Script::status(422),
        Script::status(422),
        Script::status(503),
    ];
    let transport = ScriptedTransport::new(all);
    let app = build_app(scripted_config(), transport);
    let (status, _, _) = app
        .request(
            "PUT",
            "/v1/a/c/o",
            &[
                ("content-length", "0"),
                ("etag", "68b329da9893e34099c7d8ad5cb9c940"),
            ],
            b"",
        )
        .await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn put_body_reaches_every_ready_backend() {
    let (app, transport) = scripted_app(&[200, 201, 201, 201]);
    let (status, _, _) = app
        .request("PUT", "/v1/a/c/o", &[("content-length", "5")], b"hello")
        .await;
    assert_eq!(status, 201);
    let recorded = transport.recorded();
    let puts: Vec<_> = recorded.iter().filter(|r| r.method == "PUT").collect();
    assert_eq!(puts.len(), 3);
    for put in puts {
        assert_eq!(&put.body.lock().unwrap()[..], b"hello");
    }
}

#[tokio::test]
async fn oversized_put_is_rejected_without_backend_traffic() {
    let transport = ScriptedTransport::new(Vec::new());
    let app = build_app(scripted_config(), transport.clone());
    let too_big = (magpie::constraints::MAX_FILE_SIZE + 1).to_string();
    let (status, _, _) = app
        .request("PUT", "/v1/a/c/o", &[("content-length", &too_big)], b"")
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(transport.recorded().is_empty());
}

#[tokio::test]
async fn stalled_client_body_times_out_with_408() {
    struct StallBody;
    impl http_body::Body for StallBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;
        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
            std::task::Poll::Pending
        }
    }

    let transport = ScriptedTransport::new(scripts(&[200, 201, 201, 201]));
    let config = ProxyConfig {
        client_timeout: 0.05,
        max_handoffs: Some(0),
        ..ProxyConfig::default()
    };
    let app = build_app(config, transport);
    let request = http::Request::builder()
        .method("PUT")
        .uri("/v1/a/c/o")
        .header("content-length", "4")
        .body(StallBody)
        .unwrap();
    let response = app.app.handle(request).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
}

#[tokio::test]
async fn dead_client_body_maps_to_499() {
    struct DeadBody;
    impl http_body::Body for DeadBody {
        type Data = Bytes;
        type Error = std::io::Error;
        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<http_body::Frame<Bytes>, Self::Error>>> {
            std::task::Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            ))))
        }
    }

    let transport = ScriptedTransport::new(scripts(&[200, 201, 201, 201]));
    let app = build_app(scripted_config(), transport);
    let request = http::Request::builder()
        .method("PUT")
        .uri("/v1/a/c/o")
        .header("content-length", "4")
        .body(DeadBody)
        .unwrap();
    let response = app.app.handle(request).await;
    assert_eq!(response.status().as_u16(), 499);
}
