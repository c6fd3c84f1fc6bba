//! The authorization hook: injected denials short-circuit, ACLs flow into
//! the hook's context, invalid ACL syntax is rejected up front.

mod common;

use common::{build_app, InMemoryCluster, ScriptedTransport};
use http::StatusCode;
use magpie::{AuthContext, AuthDenial, Authorizer, ProxyConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct DenyWrites {
    denied: AtomicUsize,
    seen_acls: Mutex<Vec<Option<String>>>,
}

impl Authorizer for DenyWrites {
    fn authorize(&self, ctx: &AuthContext<'_>) -> Option<AuthDenial> {
        self.seen_acls.lock().unwrap().push(ctx.acl.map(str::to_string));
        if matches!(ctx.method.as_str(), "PUT" | "POST" | "DELETE" | "COPY") {
            self.denied.fetch_add(1, Ordering::SeqCst);
            return Some(AuthDenial {
                status: StatusCode::FORBIDDEN,
                message: "writes denied".into(),
            });
        }
        None
    }
}

#[tokio::test]
async fn denials_short_circuit_before_dispatch() {
    let transport = ScriptedTransport::new(Vec::new());
    let auth = Arc::new(DenyWrites::default());
    let config = ProxyConfig { max_handoffs: Some(0), ..ProxyConfig::default() };
    let app = app_with_auth(config, transport.clone(), auth.clone());

    let (status, _, body) = app
        .request("PUT", "/v1/a/c", &[("content-length", "0")], b"")
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(String::from_utf8_lossy(&body).contains("writes denied"));
    assert_eq!(auth.denied.load(Ordering::SeqCst), 1);
    assert!(transport.recorded().is_empty());
}

#[tokio::test]
async fn reads_pass_when_the_hook_allows() {
    let cluster = InMemoryCluster::new();
    let auth = Arc::new(DenyWrites::default());
    let config = ProxyConfig {
        allow_account_management: true,
        ..ProxyConfig::default()
    };
    // Build without the hook to create fixtures, then query through it.
    let setup = build_app(config.clone(), cluster.clone());
    assert_eq!(setup.request("PUT", "/v1/a", &[], b"").await.0, 201);
    assert_eq!(setup.request("PUT", "/v1/a/c", &[], b"").await.0, 201);
    assert_eq!(setup.request("PUT", "/v1/a/c/o", &[], b"data").await.0, 201);

    let app = app_with_auth(config, cluster, auth.clone());
    let (status, _, body) = app.request("GET", "/v1/a/c/o", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"data");
    assert_eq!(auth.denied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn container_acls_reach_the_hook_context() {
    let cluster = InMemoryCluster::new();
    let auth = Arc::new(DenyWrites::default());
    let config = ProxyConfig {
        allow_account_management: true,
        ..ProxyConfig::default()
    };
    let setup = build_app(config.clone(), cluster.clone());
    assert_eq!(setup.request("PUT", "/v1/a", &[], b"").await.0, 201);
    assert_eq!(
        setup
            .request("PUT", "/v1/a/c", &[("x-container-read", ".r:*")], b"")
            .await
            .0,
        201
    );
    assert_eq!(setup.request("PUT", "/v1/a/c/o", &[], b"data").await.0, 201);

    let app = app_with_auth(config, cluster, auth.clone());
    // First GET populates the container cache; the second sees the ACL.
    let _ = app.request("GET", "/v1/a/c/o", &[], b"").await;
    let (status, _, _) = app.request("GET", "/v1/a/c/o", &[], b"").await;
    assert_eq!(status, StatusCode::OK);
    let acls = auth.seen_acls.lock().unwrap();
    assert!(acls.iter().any(|acl| acl.as_deref() == Some(".r:*")));
}

#[tokio::test]
async fn invalid_acl_syntax_is_a_bad_request() {
    let transport = ScriptedTransport::new(Vec::new());
    let config = ProxyConfig { max_handoffs: Some(0), ..ProxyConfig::default() };
    let app = build_app(config, transport.clone());

    for value in [".r:", ".unknown:x"] {
        let (status, _, _) = app
            .request(
                "PUT",
                "/v1/a/c",
                &[("x-container-read", value), ("content-length", "0")],
                b"",
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "acl {value}");
    }
    // Referrer designators are read-only concepts.
    let (status, _, _) = app
        .request(
            "PUT",
            "/v1/a/c",
            &[("x-container-write", ".r:*"), ("content-length", "0")],
            b"",
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(transport.recorded().is_empty());
}

fn app_with_auth(
    config: ProxyConfig,
    transport: Arc<dyn magpie::Transport>,
    auth: Arc<DenyWrites>,
) -> common::TestApp {
    let clock = Arc::new(magpie::ManualClock::new(1_300_000_000_000_000));
    let sleeper = Arc::new(magpie::TrackingSleeper::new());
    let cache = Arc::new(magpie::MemoryCache::new(clock.clone()));
    let app = magpie::Application::builder(config, common::test_rings(), transport)
        .clock(clock.clone())
        .sleeper(sleeper.clone())
        .cache_backend(cache.clone())
        .authorizer(auth)
        .build();
    common::TestApp { app, clock, sleeper, cache }
}
