//! Shared test harness: deterministic transports and an application builder.
//!
//! Two fakes cover the two kinds of tests:
//! - [`ScriptedTransport`] plays back per-connection scripts (status, etag,
//!   timestamp, body) in connect order, with negative statuses standing in
//!   for connect/handshake failures. Used for quorum and error-limiting
//!   matrices.
//! - [`InMemoryCluster`] emulates a perfectly consistent set of
//!   account/container/object servers, enough to exercise versioning,
//!   manifests and listings end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use magpie::app::Rings;
use magpie::clock::ManualClock;
use magpie::ring::{Node, Ring, RingData};
use magpie::sleeper::TrackingSleeper;
use magpie::transport::{Exchange, RequestHead, ResponseHead, Transport};
use magpie::{Application, MemoryCache, ProxyConfig, TransportError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Rings

/// A ring with three replicas across four zones and two partitions; every
/// tier gets its own instance so error counters stay independent.
pub fn test_ring() -> Arc<Ring> {
    let devs: Vec<Option<Node>> = (0..8u16)
        .map(|id| {
            Some(Node {
                id,
                zone: u32::from(id) % 4,
                ip: format!("10.0.0.{id}"),
                port: 6000 + id,
                device: format!("sd{id}"),
            })
        })
        .collect();
    let data = RingData {
        part_shift: 31,
        replica2part2dev: vec![vec![0, 1], vec![2, 3], vec![4, 5]],
        devs,
    };
    Arc::new(Ring::new(data, "magpie-test").unwrap())
}

pub fn test_rings() -> Rings {
    Rings { account: test_ring(), container: test_ring(), object: test_ring() }
}

// ---------------------------------------------------------------------------
// Scripted transport

#[derive(Debug, Clone)]
pub struct Script {
    pub status: i32,
    pub etag: Option<String>,
    pub timestamp: Option<String>,
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

impl Script {
    pub fn status(status: i32) -> Self {
        Self {
            status,
            etag: Some("68b329da9893e34099c7d8ad5cb9c940".to_string()),
            timestamp: Some("1".to_string()),
            body: Bytes::new(),
            headers: Vec::new(),
        }
    }

    pub fn etag(mut self, etag: Option<&str>) -> Self {
        self.etag = etag.map(str::to_string);
        self
    }

    pub fn timestamp(mut self, ts: Option<&str>) -> Self {
        self.timestamp = ts.map(str::to_string);
        self
    }

    pub fn body(mut self, body: &[u8]) -> Self {
        self.body = Bytes::copy_from_slice(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub fn scripts(codes: &[i32]) -> Vec<Script> {
    codes.iter().map(|&c| Script::status(c)).collect()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub node_id: u16,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Arc<Mutex<BytesMut>>,
}

/// Plays back one script per backend connection, in connect order.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self { scripts: Mutex::new(scripts.into()), requests: Mutex::new(Vec::new()) })
    }

    pub fn load(&self, scripts: Vec<Script>) {
        *self.scripts.lock().unwrap() = scripts.into();
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        node: &Node,
        _part: u32,
        head: &RequestHead,
    ) -> Result<Box<dyn Exchange>, TransportError> {
        let script = self.scripts.lock().unwrap().pop_front().ok_or_else(|| {
            TransportError::Connect {
                addr: node.addr(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "script exhausted"),
            }
        })?;
        if script.status == -1 {
            return Err(TransportError::Connect {
                addr: node.addr(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "scripted"),
            });
        }
        let body = Arc::new(Mutex::new(BytesMut::new()));
        self.requests.lock().unwrap().push(RecordedRequest {
            node_id: node.id,
            method: head.method.to_string(),
            path: head.path.clone(),
            query: head.query.clone(),
            headers: head.headers.clone(),
            body: body.clone(),
        });
        Ok(Box::new(ScriptedExchange {
            script,
            method: head.method.clone(),
            sent: body,
            body_done: false,
        }))
    }
}

struct ScriptedExchange {
    script: Script,
    method: Method,
    sent: Arc<Mutex<BytesMut>>,
    body_done: bool,
}

#[async_trait]
impl Exchange for ScriptedExchange {
    async fn await_continue(&mut self) -> Result<StatusCode, TransportError> {
        match self.script.status {
            -2 => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted expect failure",
            ))),
            -3 => Err(TransportError::ExpectRefused(507)),
            _ => Ok(StatusCode::CONTINUE),
        }
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        self.sent.lock().unwrap().extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish_body(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read_response(&mut self) -> Result<ResponseHead, TransportError> {
        let status = StatusCode::from_u16(self.script.status.max(0) as u16)
            .map_err(|_| TransportError::Malformed("scripted status out of range"))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-length",
            HeaderValue::from_str(&self.script.body.len().to_string()).unwrap(),
        );
        headers.insert("content-type", HeaderValue::from_static("x-application/test"));
        if let Some(ts) = &self.script.timestamp {
            headers.insert("x-timestamp", HeaderValue::from_str(ts).unwrap());
            headers.insert("last-modified", HeaderValue::from_str(ts).unwrap());
        }
        if let Some(etag) = &self.script.etag {
            headers.insert("etag", HeaderValue::from_str(&format!("\"{etag}\"")).unwrap());
        }
        for (name, value) in &self.script.headers {
            headers.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Ok(ResponseHead { status, headers })
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.body_done || self.method == Method::HEAD || self.script.body.is_empty() {
            return Ok(None);
        }
        self.body_done = true;
        Ok(Some(self.script.body.clone()))
    }
}

// ---------------------------------------------------------------------------
// In-memory cluster

#[derive(Debug, Clone, Default)]
struct ObjectRec {
    body: Bytes,
    etag: String,
    content_type: String,
    timestamp: String,
    meta: BTreeMap<String, String>,
    extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct ContainerRec {
    meta: BTreeMap<String, String>,
    objects: BTreeMap<String, ObjectRec>,
}

#[derive(Debug, Default)]
struct ClusterState {
    accounts: HashMap<String, BTreeMap<String, String>>,
    containers: HashMap<(String, String), ContainerRec>,
}

/// A perfectly consistent backend cluster: every node answers from the same
/// shared state, so quorum always succeeds and end-to-end semantics
/// (versioning, manifests, listings) can be exercised for real.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object_names(&self, account: &str, container: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(&(account.to_string(), container.to_string()))
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Insert an object directly, bypassing the proxy. For fixtures too
    /// large to create request-by-request (listing-limit tests).
    pub fn seed_object(&self, account: &str, container: &str, name: &str, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let rec = state
            .containers
            .entry((account.to_string(), container.to_string()))
            .or_default();
        let body = Bytes::copy_from_slice(body);
        let etag = format!("{:x}", md5::compute(&body));
        rec.objects.insert(
            name.to_string(),
            ObjectRec {
                body,
                etag,
                content_type: "application/octet-stream".into(),
                timestamp: "0000000001.00000".into(),
                ..Default::default()
            },
        );
    }
}

fn split_path(path: &str) -> (String, Option<String>, Option<String>) {
    let mut parts = path.trim_start_matches('/').splitn(3, '/');
    let account = parts.next().unwrap_or_default().to_string();
    let container = parts.next().map(str::to_string);
    let object = parts.next().map(str::to_string);
    (account, container, object)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(
                std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("xx"),
                16,
            ) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(query) = query else {
        return out;
    };
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(key.to_string(), percent_decode(value));
    }
    out
}

type Reply = (u16, Vec<(String, String)>, Bytes);

fn header_of(head: &RequestHead, name: &str) -> Option<String> {
    head.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn container_meta_update(rec: &mut ContainerRec, head: &RequestHead) {
    for (name, value) in &head.headers {
        let name = name.as_str();
        if name.starts_with("x-container-") || name == "x-versions-location" {
            let value = value.to_str().unwrap_or("").to_string();
            if value.is_empty() {
                rec.meta.remove(name);
            } else {
                rec.meta.insert(name.to_string(), value);
            }
        }
    }
}

fn compute(state: &mut ClusterState, head: &RequestHead, sent: &[u8]) -> Reply {
    let (account, container, object) = split_path(&head.path);
    let method = head.method.as_str();
    let timestamp = header_of(head, "x-timestamp").unwrap_or_else(|| "0".to_string());

    match (method, container, object) {
        // Account level.
        ("PUT", None, _) => {
            state.accounts.entry(account).or_default();
            (201, vec![], Bytes::new())
        }
        ("HEAD" | "GET", None, _) => {
            if !state.accounts.contains_key(&account) {
                return (404, vec![], Bytes::new());
            }
            let names: Vec<String> = state
                .containers
                .keys()
                .filter(|(acct, _)| acct == &account)
                .map(|(_, name)| name.clone())
                .collect();
            let headers = vec![
                ("x-account-container-count".to_string(), names.len().to_string()),
                ("x-account-bytes-used".to_string(), "0".to_string()),
            ];
            if method == "HEAD" || names.is_empty() {
                return (204, headers, Bytes::new());
            }
            (200, headers, Bytes::from(names.join("\n") + "\n"))
        }
        ("DELETE", None, _) => {
            let existed = state.accounts.remove(&account).is_some();
            (if existed { 204 } else { 404 }, vec![], Bytes::new())
        }

        // Container level.
        ("PUT", Some(container), None) => {
            if !state.accounts.contains_key(&account) {
                return (404, vec![], Bytes::new());
            }
            let key = (account, container);
            let existed = state.containers.contains_key(&key);
            let rec = state.containers.entry(key).or_default();
            container_meta_update(rec, head);
            (if existed { 202 } else { 201 }, vec![], Bytes::new())
        }
        ("POST", Some(container), None) => {
            let key = (account, container);
            match state.containers.get_mut(&key) {
                None => (404, vec![], Bytes::new()),
                Some(rec) => {
                    container_meta_update(rec, head);
                    (204, vec![], Bytes::new())
                }
            }
        }
        ("HEAD" | "GET", Some(container), None) => {
            let key = (account, container);
            let Some(rec) = state.containers.get(&key) else {
                return (404, vec![], Bytes::new());
            };
            let meta: Vec<(String, String)> =
                rec.meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            if method == "HEAD" {
                return (204, meta, Bytes::new());
            }
            let params = parse_query(head.query.as_deref());
            let prefix = params.get("prefix").cloned().unwrap_or_default();
            let marker = params.get("marker").cloned().unwrap_or_default();
            let limit: usize =
                params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(10_000);
            let selected: Vec<(&String, &ObjectRec)> = rec
                .objects
                .iter()
                .filter(|(name, _)| name.starts_with(&prefix))
                .filter(|(name, _)| marker.is_empty() || name.as_str() > marker.as_str())
                .take(limit)
                .collect();
            if selected.is_empty() {
                return (204, meta, Bytes::new());
            }
            let body = match params.get("format").map(String::as_str) {
                Some("json") => {
                    let entries: Vec<serde_json::Value> = selected
                        .iter()
                        .map(|(name, obj)| {
                            serde_json::json!({
                                "name": name,
                                "bytes": obj.body.len(),
                                "hash": obj.etag,
                                "content_type": obj.content_type,
                                "last_modified": obj.timestamp,
                            })
                        })
                        .collect();
                    Bytes::from(serde_json::to_vec(&entries).unwrap())
                }
                _ => {
                    let names: Vec<&str> =
                        selected.iter().map(|(name, _)| name.as_str()).collect();
                    Bytes::from(names.join("\n") + "\n")
                }
            };
            (200, meta, body)
        }
        ("DELETE", Some(container), None) => {
            let key = (account, container);
            match state.containers.get(&key) {
                None => (404, vec![], Bytes::new()),
                Some(rec) if !rec.objects.is_empty() => (409, vec![], Bytes::new()),
                Some(_) => {
                    state.containers.remove(&key);
                    (204, vec![], Bytes::new())
                }
            }
        }

        // Object level.
        ("PUT", Some(container), Some(object)) => {
            let key = (account, container);
            let Some(rec) = state.containers.get_mut(&key) else {
                return (404, vec![], Bytes::new());
            };
            let body = Bytes::copy_from_slice(sent);
            let etag = format!("{:x}", md5::compute(&body));
            if let Some(expected) = header_of(head, "etag") {
                if expected.trim_matches('"') != etag {
                    return (422, vec![], Bytes::new());
                }
            }
            let mut obj = ObjectRec {
                body,
                etag: etag.clone(),
                content_type: header_of(head, "content-type")
                    .unwrap_or_else(|| "application/octet-stream".into()),
                timestamp,
                ..Default::default()
            };
            for (name, value) in &head.headers {
                let name = name.as_str();
                if let Some(rest) = name.strip_prefix("x-object-meta-") {
                    obj.meta.insert(rest.to_string(), value.to_str().unwrap_or("").into());
                } else if matches!(
                    name,
                    "x-object-manifest" | "x-delete-at" | "content-encoding"
                        | "content-disposition"
                ) {
                    obj.extra.insert(name.to_string(), value.to_str().unwrap_or("").into());
                }
            }
            rec.objects.insert(object, obj);
            (201, vec![("etag".to_string(), etag)], Bytes::new())
        }
        ("POST", Some(container), Some(object)) => {
            let key = (account, container);
            let Some(obj) =
                state.containers.get_mut(&key).and_then(|rec| rec.objects.get_mut(&object))
            else {
                return (404, vec![], Bytes::new());
            };
            obj.meta.clear();
            for (name, value) in &head.headers {
                if let Some(rest) = name.as_str().strip_prefix("x-object-meta-") {
                    obj.meta.insert(rest.to_string(), value.to_str().unwrap_or("").into());
                }
            }
            if let Some(ct) = header_of(head, "content-type") {
                obj.content_type = ct;
            }
            (202, vec![], Bytes::new())
        }
        ("GET" | "HEAD", Some(container), Some(object)) => {
            let key = (account, container);
            let Some(obj) =
                state.containers.get(&key).and_then(|rec| rec.objects.get(&object)).cloned()
            else {
                return (404, vec![], Bytes::new());
            };
            let mut headers = vec![
                ("content-type".to_string(), obj.content_type.clone()),
                ("etag".to_string(), format!("\"{}\"", obj.etag)),
                ("x-timestamp".to_string(), obj.timestamp.clone()),
                ("last-modified".to_string(), obj.timestamp.clone()),
            ];
            for (name, value) in &obj.meta {
                headers.push((format!("x-object-meta-{name}"), value.clone()));
            }
            for (name, value) in &obj.extra {
                headers.push((name.clone(), value.clone()));
            }
            // Single-range support, enough for segment fetches.
            if method == "GET" {
                if let Some(spec) =
                    header_of(head, "range").and_then(|r| r.strip_prefix("bytes=").map(String::from))
                {
                    let total = obj.body.len() as u64;
                    let (start, end) = match spec.split_once('-') {
                        Some((s, e)) if !s.is_empty() => {
                            let start: u64 = s.parse().unwrap_or(0);
                            let end: u64 = if e.is_empty() {
                                total.saturating_sub(1)
                            } else {
                                e.parse::<u64>().unwrap_or(0).min(total.saturating_sub(1))
                            };
                            (start, end)
                        }
                        Some((_, e)) => {
                            let n: u64 = e.parse().unwrap_or(0);
                            (total.saturating_sub(n), total.saturating_sub(1))
                        }
                        None => (0, total.saturating_sub(1)),
                    };
                    if start >= total {
                        return (416, headers, Bytes::new());
                    }
                    headers.push((
                        "content-range".to_string(),
                        format!("bytes {start}-{end}/{total}"),
                    ));
                    let slice = obj.body.slice(start as usize..=end as usize);
                    return (206, headers, slice);
                }
            }
            (200, headers, obj.body.clone())
        }
        ("DELETE", Some(container), Some(object)) => {
            let key = (account, container);
            let existed = state
                .containers
                .get_mut(&key)
                .map(|rec| rec.objects.remove(&object).is_some())
                .unwrap_or(false);
            (if existed { 204 } else { 404 }, vec![], Bytes::new())
        }
        _ => (405, vec![], Bytes::new()),
    }
}

struct ClusterExchange {
    state: Arc<Mutex<ClusterState>>,
    head: RequestHead,
    sent: BytesMut,
    response: Option<ResponseHead>,
    body: Option<Bytes>,
}

#[async_trait]
impl Transport for InMemoryCluster {
    async fn connect(
        &self,
        _node: &Node,
        _part: u32,
        head: &RequestHead,
    ) -> Result<Box<dyn Exchange>, TransportError> {
        Ok(Box::new(ClusterExchange {
            state: self.state.clone(),
            head: head.clone(),
            sent: BytesMut::new(),
            response: None,
            body: None,
        }))
    }
}

#[async_trait]
impl Exchange for ClusterExchange {
    async fn await_continue(&mut self) -> Result<StatusCode, TransportError> {
        Ok(StatusCode::CONTINUE)
    }

    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        self.sent.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish_body(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn read_response(&mut self) -> Result<ResponseHead, TransportError> {
        if self.response.is_none() {
            let (status, headers, body) = {
                let mut state = self.state.lock().unwrap();
                compute(&mut state, &self.head, &self.sent)
            };
            let mut map = HeaderMap::new();
            map.insert(
                "content-length",
                HeaderValue::from_str(&body.len().to_string()).unwrap(),
            );
            for (name, value) in headers {
                if let (Ok(name), Ok(value)) =
                    (name.parse::<HeaderName>(), HeaderValue::from_str(&value))
                {
                    map.insert(name, value);
                }
            }
            self.response = Some(ResponseHead {
                status: StatusCode::from_u16(status)
                    .map_err(|_| TransportError::Malformed("bad fake status"))?,
                headers: map,
            });
            if self.head.method != Method::HEAD {
                self.body = Some(body);
            }
        }
        Ok(self.response.clone().expect("response computed above"))
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.body.take().filter(|b| !b.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// Application harness

pub struct TestApp {
    pub app: Application,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<TrackingSleeper>,
    pub cache: Arc<MemoryCache>,
}

pub fn build_app(config: ProxyConfig, transport: Arc<dyn Transport>) -> TestApp {
    let clock = Arc::new(ManualClock::new(1_300_000_000_000_000));
    let sleeper = Arc::new(TrackingSleeper::new());
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let app = Application::builder(config, test_rings(), transport)
        .clock(clock.clone())
        .sleeper(sleeper.clone())
        .cache_backend(cache.clone())
        .build();
    TestApp { app, clock, sleeper, cache }
}

pub fn default_app(transport: Arc<dyn Transport>) -> TestApp {
    build_app(ProxyConfig::default(), transport)
}

impl TestApp {
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let needs_length = matches!(method, "PUT" | "POST" | "COPY")
            && !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            && !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"));
        if needs_length {
            builder = builder.header("content-length", body.len());
        }
        let request = builder.body(Full::new(Bytes::copy_from_slice(body))).unwrap();
        let response = self.app.handle(request).await;
        let (parts, body) = response.into_parts();
        let collected = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        (parts.status, parts.headers, collected)
    }

    /// Drop cached lookup state so the next request hits backends.
    pub async fn purge_lookups(&self, account: &str, containers: &[&str]) {
        use magpie::CacheBackend;
        self.cache.delete(&format!("account/{account}")).await;
        for container in containers {
            self.cache.delete(&format!("container/{account}/{container}")).await;
        }
    }
}
