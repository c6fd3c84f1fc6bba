//! End-to-end versioned write/delete walk against the in-memory cluster.

mod common;

use common::{build_app, InMemoryCluster, TestApp};
use http::StatusCode;
use magpie::ProxyConfig;
use std::sync::Arc;

async fn versioned_app() -> (TestApp, Arc<InMemoryCluster>) {
    let cluster = InMemoryCluster::new();
    let config = ProxyConfig {
        allow_account_management: true,
        allow_versions: true,
        ..ProxyConfig::default()
    };
    let app = build_app(config, cluster.clone());
    assert_eq!(app.request("PUT", "/v1/a", &[], b"").await.0, 201);
    assert_eq!(
        app.request("PUT", "/v1/a/versions", &[("x-versions-location", "vers")], b"")
            .await
            .0,
        201
    );
    assert_eq!(app.request("PUT", "/v1/a/vers", &[], b"").await.0, 201);
    (app, cluster)
}

#[tokio::test]
async fn versions_location_requires_the_feature_flag() {
    let cluster = InMemoryCluster::new();
    let config = ProxyConfig {
        allow_account_management: true,
        allow_versions: false,
        ..ProxyConfig::default()
    };
    let app = build_app(config, cluster);
    assert_eq!(app.request("PUT", "/v1/a", &[], b"").await.0, 201);
    let (status, _, _) = app
        .request("PUT", "/v1/a/versions", &[("x-versions-location", "vers")], b"")
        .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn versions_location_round_trips_on_the_container() {
    let (app, _cluster) = versioned_app().await;
    let (status, headers, _) = app.request("HEAD", "/v1/a/versions", &[], b"").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers.get("x-versions-location").unwrap(), "vers");
}

#[tokio::test]
async fn overwrites_archive_and_deletes_restore() {
    let (app, cluster) = versioned_app().await;

    // Three generations of the same object.
    for (i, body) in [b"00000", b"00001", b"00002"].iter().enumerate() {
        let ct = format!("text/gen{i}");
        let (status, _, _) = app
            .request(
                "PUT",
                "/v1/a/versions/name",
                &[("content-type", ct.as_str())],
                *body,
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "generation {i}");
    }

    let (status, headers, body) = app.request("GET", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"00002");
    assert_eq!(headers.get("content-type").unwrap(), "text/gen2");

    // Two archived generations, newest first by name.
    let archived = cluster.object_names("a", "vers");
    assert_eq!(archived.len(), 2);
    assert!(archived.iter().all(|name| name.starts_with("004name/")));
    let (status, _, body) = app
        .request("GET", "/v1/a/vers?prefix=004name/", &[], b"")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.iter().filter(|&&b| b == b'\n').count(), 2);

    // Each delete pops the previous generation back.
    let (status, _, _) = app.request("DELETE", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    let (status, headers, body) = app.request("GET", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"00001");
    assert_eq!(headers.get("content-type").unwrap(), "text/gen1");
    assert_eq!(cluster.object_names("a", "vers").len(), 1);

    let (status, _, _) = app.request("DELETE", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = app.request("GET", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(body.as_ref(), b"00000");
    assert!(cluster.object_names("a", "vers").is_empty());

    // Last delete is a real delete: nothing left to restore.
    let (status, _, _) = app.request("DELETE", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = app.request("GET", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_versions_container_fails_the_overwrite() {
    let cluster = InMemoryCluster::new();
    let config = ProxyConfig {
        allow_account_management: true,
        allow_versions: true,
        ..ProxyConfig::default()
    };
    let app = build_app(config, cluster);
    assert_eq!(app.request("PUT", "/v1/a", &[], b"").await.0, 201);
    assert_eq!(
        app.request("PUT", "/v1/a/versions", &[("x-versions-location", "vers")], b"")
            .await
            .0,
        201
    );
    // No "vers" container exists. The first PUT has nothing to archive and
    // succeeds; the overwrite must fail the precondition.
    assert_eq!(
        app.request("PUT", "/v1/a/versions/name", &[], b"first").await.0,
        201
    );
    let (status, _, _) = app.request("PUT", "/v1/a/versions/name", &[], b"second").await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn manifest_objects_are_not_archived() {
    let (app, cluster) = versioned_app().await;
    let (status, _, _) = app
        .request(
            "PUT",
            "/v1/a/versions/pointer",
            &[("x-object-manifest", "versions/segments/")],
            b"",
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    // Overwriting the manifest pointer archives nothing.
    let (status, _, _) = app
        .request(
            "PUT",
            "/v1/a/versions/pointer",
            &[("x-object-manifest", "versions/segments/")],
            b"",
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(cluster.object_names("a", "vers").is_empty());
}

#[tokio::test]
async fn post_never_creates_versions() {
    let (app, cluster) = versioned_app().await;
    assert_eq!(
        app.request("PUT", "/v1/a/versions/name", &[], b"body").await.0,
        201
    );
    let (status, _, _) = app
        .request(
            "POST",
            "/v1/a/versions/name",
            &[("x-object-meta-note", "updated")],
            b"",
        )
        .await;
    assert!(status.is_success());
    assert!(cluster.object_names("a", "vers").is_empty());

    let (_, headers, body) = app.request("GET", "/v1/a/versions/name", &[], b"").await;
    assert_eq!(body.as_ref(), b"body");
    assert_eq!(headers.get("x-object-meta-note").unwrap(), "updated");
}
