//! In-process fake cluster node for tests.
//!
//! Serves the object, props, counter, stats and listing resources over a
//! real HTTP listener on `127.0.0.1:0`, keeping data in memory. Every
//! response carries `Connection: close` so a stopped node refuses the next
//! request instead of answering over a pooled socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::object::{content_md5, object_path, CLIENT_ID_HEADER, VCLOCK_HEADER};

type Params = Query<HashMap<String, String>>;

#[derive(Clone)]
struct Stored {
    value: Bytes,
    content_type: String,
    vclock: String,
    etag: String,
    last_modified: SystemTime,
    echoed: Vec<(HeaderName, HeaderValue)>,
}

#[derive(Default)]
struct FakeState {
    objects: Mutex<HashMap<(String, String), Stored>>,
    props: Mutex<HashMap<String, Map<String, Value>>>,
    counters: Mutex<HashMap<(String, String), i64>>,
    siblings: Mutex<HashMap<(String, String), Vec<String>>>,
    client_ids: Mutex<Vec<String>>,
    failing: AtomicBool,
    stats_disabled: AtomicBool,
    corrupt_uploads: AtomicBool,
    /// Largest n_val the props resource accepts; 0 means no limit.
    max_n_val: AtomicU64,
    delay_ms: AtomicU64,
    pings: AtomicU64,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl FakeState {
    async fn stall(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn note_client(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(CLIENT_ID_HEADER).and_then(|v| v.to_str().ok()) {
            self.client_ids.lock().unwrap().push(id.to_string());
        }
    }

    fn props_for(&self, bucket: &str) -> Map<String, Value> {
        let mut props = default_props(bucket);
        if let Some(custom) = self.props.lock().unwrap().get(bucket) {
            props.extend(custom.clone());
        }
        props
    }

    fn n_val(&self, bucket: &str) -> u64 {
        self.props_for(bucket)
            .get("n_val")
            .and_then(Value::as_u64)
            .unwrap_or(3)
    }

    fn allow_mult(&self, bucket: &str) -> bool {
        self.props_for(bucket)
            .get("allow_mult")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn default_props(bucket: &str) -> Map<String, Value> {
    let value = json!({
        "name": bucket,
        "n_val": 3,
        "allow_mult": false,
        "last_write_wins": false,
        "r": "quorum",
        "w": "quorum",
        "dw": "quorum",
        "rw": "quorum",
        "precommit": [],
        "postcommit": [],
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Handle to a running fake node.
pub(crate) struct FakeNode {
    addr: SocketAddr,
    state: Arc<FakeState>,
    server: JoinHandle<()>,
}

impl FakeNode {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            state,
            server,
        }
    }

    /// `host:port` of the listener.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Make `/ping` answer 503.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay ping and object reads by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Flip a byte of every stored body before checking Content-MD5.
    pub fn corrupt_uploads(&self) {
        self.state.corrupt_uploads.store(true, Ordering::SeqCst);
    }

    /// Reject props updates whose n_val exceeds `n_val`.
    pub fn set_max_n_val(&self, n_val: u64) {
        self.state.max_n_val.store(n_val, Ordering::SeqCst);
    }

    pub fn disable_stats(&self) {
        self.state.stats_disabled.store(true, Ordering::SeqCst);
    }

    /// Make reads of `bucket/key` answer `300 Multiple Choices`.
    pub fn add_siblings(&self, bucket: &str, key: &str, vtags: &[&str]) {
        self.state.siblings.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            vtags.iter().map(|v| v.to_string()).collect(),
        );
    }

    pub fn ping_count(&self) -> u64 {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().unwrap().clone()
    }

    /// Stop serving; later requests fail with connection refused.
    pub fn stop(&self) {
        self.server.abort();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// An address nothing listens on.
pub(crate) async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn router(state: Arc<FakeState>) -> Router {
    Router::new()
        .route("/", get(resources))
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/buckets", get(list_buckets))
        .route("/buckets/:bucket/keys", get(list_keys).post(create_object))
        .route(
            "/buckets/:bucket/keys/:key",
            get(fetch_object).put(put_object).delete(delete_object),
        )
        .route(
            "/buckets/:bucket/props",
            get(get_props).put(set_props).delete(reset_props),
        )
        .route(
            "/buckets/:bucket/counters/:key",
            get(get_counter).post(update_counter),
        )
        .layer(axum::middleware::map_response(close_connection))
        .with_state(state)
}

async fn close_connection(mut res: Response) -> Response {
    res.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    res
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn check_quorums(params: &HashMap<String, String>, names: &[&str], n_val: u64) -> Option<Response> {
    for name in names {
        let Some(raw) = params.get(*name) else {
            continue;
        };
        let ok = match raw.as_str() {
            "all" | "one" | "quorum" | "default" => true,
            other => other.parse::<u64>().map(|n| n >= 1 && n <= n_val).unwrap_or(false),
        };
        if !ok {
            return Some(text(
                StatusCode::BAD_REQUEST,
                format!("invalid {name} value '{raw}' for bucket n_val of {n_val}\n"),
            ));
        }
    }
    None
}

fn object_response(status: StatusCode, stored: &Stored, location: Option<String>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&stored.content_type) {
        headers.insert(header::CONTENT_TYPE, v);
    }
    if let Ok(v) = HeaderValue::from_str(&stored.vclock) {
        headers.insert(HeaderName::from_static(VCLOCK_HEADER), v);
    }
    if let Ok(v) = HeaderValue::from_str(&stored.etag) {
        headers.insert(header::ETAG, v);
    }
    if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(stored.last_modified)) {
        headers.insert(header::LAST_MODIFIED, v);
    }
    for (name, value) in &stored.echoed {
        headers.insert(name.clone(), value.clone());
    }
    if let Some(loc) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
        headers.insert(header::LOCATION, loc);
    }
    let body = if status == StatusCode::NO_CONTENT {
        Bytes::new()
    } else {
        stored.value.clone()
    };
    (status, headers, body).into_response()
}

// -- Node-level resources ------------------------------------------------------

async fn ping(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    state.pings.fetch_add(1, Ordering::SeqCst);
    state.note_client(&headers);
    state.stall().await;
    if state.failing.load(Ordering::SeqCst) {
        return text(StatusCode::SERVICE_UNAVAILABLE, "unavailable");
    }
    text(StatusCode::OK, "OK")
}

async fn stats(State(state): State<Arc<FakeState>>) -> Response {
    if state.stats_disabled.load(Ordering::SeqCst) {
        return text(StatusCode::NOT_FOUND, "not found");
    }
    axum::Json(json!({
        "nodename": "fake@127.0.0.1",
        "vnode_gets": state.gets.load(Ordering::SeqCst),
        "vnode_puts": state.puts.load(Ordering::SeqCst),
        "node_get_fsm_time_mean": 1250.5,
        "ring_members": ["fake@127.0.0.1"],
        "storage_backend": "riak_kv_memory_backend",
        "riak_kv_version": "1.4.12",
        "disk": [{"id": "/", "size": 1024, "used": 12}],
    }))
    .into_response()
}

async fn resources(headers: HeaderMap) -> Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if !wants_json {
        return (
            [(header::CONTENT_TYPE, "text/html")],
            "<html><body><ul><li><a href=\"/ping\">riak_kv_wm_ping</a></li></ul></body></html>",
        )
            .into_response();
    }
    axum::Json(json!({
        "riak_kv_wm_buckets": "/buckets",
        "riak_kv_wm_index": "/buckets",
        "riak_kv_wm_link_walker": "/buckets",
        "riak_kv_wm_mapred": "/mapred",
        "riak_kv_wm_object": "/buckets",
        "riak_kv_wm_ping": "/ping",
        "riak_kv_wm_props": "/buckets",
        "riak_kv_wm_stats": "/stats",
        "riak_kv_wm_counter": "/buckets",
    }))
    .into_response()
}

async fn list_buckets(State(state): State<Arc<FakeState>>, Query(params): Params) -> Response {
    if params.get("buckets").map(String::as_str) != Some("true") {
        return text(StatusCode::BAD_REQUEST, "buckets=true required");
    }
    let mut buckets: Vec<String> = state
        .objects
        .lock()
        .unwrap()
        .keys()
        .map(|(b, _)| b.clone())
        .collect();
    buckets.sort();
    buckets.dedup();
    axum::Json(json!({ "buckets": buckets })).into_response()
}

async fn list_keys(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    Query(params): Params,
) -> Response {
    if params.get("keys").map(String::as_str) != Some("true") {
        return text(StatusCode::BAD_REQUEST, "keys=true required");
    }
    let mut keys: Vec<String> = state
        .objects
        .lock()
        .unwrap()
        .keys()
        .filter(|(b, _)| *b == bucket)
        .map(|(_, k)| k.clone())
        .collect();
    keys.sort();
    axum::Json(json!({ "keys": keys })).into_response()
}

// -- Objects -------------------------------------------------------------------

async fn fetch_object(
    State(state): State<Arc<FakeState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Params,
) -> Response {
    state.stall().await;
    if let Some(bad) = check_quorums(&params, &["r", "pr"], state.n_val(&bucket)) {
        return bad;
    }
    state.gets.fetch_add(1, Ordering::SeqCst);
    let id = (bucket, key);
    if let Some(vtags) = state.siblings.lock().unwrap().get(&id) {
        return text(
            StatusCode::MULTIPLE_CHOICES,
            format!("Siblings:\n{}\n", vtags.join("\n")),
        );
    }
    match state.objects.lock().unwrap().get(&id) {
        Some(stored) => object_response(StatusCode::OK, stored, None),
        None => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

async fn create_object(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = uuid::Uuid::new_v4().simple().to_string();
    store(&state, bucket, key, &params, &headers, body, true)
}

async fn put_object(
    State(state): State<Arc<FakeState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Params,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store(&state, bucket, key, &params, &headers, body, false)
}

fn store(
    state: &FakeState,
    bucket: String,
    key: String,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
    created: bool,
) -> Response {
    state.note_client(headers);
    if let Some(bad) = check_quorums(params, &["w", "dw", "pw"], state.n_val(&bucket)) {
        return bad;
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let body = if state.corrupt_uploads.load(Ordering::SeqCst) && !body.is_empty() {
        let mut damaged = body.to_vec();
        damaged[0] ^= 0xff;
        Bytes::from(damaged)
    } else {
        body
    };
    if let Some(md5) = header("content-md5") {
        if md5 != content_md5(&body) {
            return text(StatusCode::BAD_REQUEST, "Content-MD5 does not match body\n");
        }
    }

    let id = (bucket, key);
    let mut objects = state.objects.lock().unwrap();
    let current = objects.get(&id);
    if let Some(etag) = header("if-match") {
        if current.map(|c| c.etag.as_str()) != Some(etag) {
            return text(StatusCode::PRECONDITION_FAILED, "");
        }
    }
    if let Some(etag) = header("if-none-match") {
        if current.is_some_and(|c| etag == "*" || c.etag == etag) {
            return text(StatusCode::PRECONDITION_FAILED, "");
        }
    }

    let echoed = headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name.starts_with("x-riak-meta-") || name.starts_with("x-riak-index-") || name == "link"
        })
        .map(|(n, v)| (n.clone(), v.clone()))
        .collect();
    let stored = Stored {
        value: body,
        content_type: header("content-type")
            .unwrap_or("application/octet-stream")
            .to_string(),
        vclock: format!("a85h{}", uuid::Uuid::new_v4().simple()),
        etag: format!("\"{}\"", uuid::Uuid::new_v4().simple()),
        last_modified: SystemTime::now(),
        echoed,
    };
    objects.insert(id.clone(), stored.clone());
    drop(objects);
    state.siblings.lock().unwrap().remove(&id);
    state.puts.fetch_add(1, Ordering::SeqCst);

    let location = created.then(|| object_path(&id.0, &id.1));
    let status = match (params.get("returnbody").map(String::as_str), created) {
        (Some("true"), true) => StatusCode::CREATED,
        (Some("true"), false) => StatusCode::OK,
        _ => StatusCode::NO_CONTENT,
    };
    object_response(status, &stored, location)
}

async fn delete_object(
    State(state): State<Arc<FakeState>>,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Params,
) -> Response {
    if let Some(bad) = check_quorums(&params, &["rw"], state.n_val(&bucket)) {
        return bad;
    }
    match state.objects.lock().unwrap().remove(&(bucket, key)) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

// -- Bucket properties ---------------------------------------------------------

async fn get_props(State(state): State<Arc<FakeState>>, Path(bucket): Path<String>) -> Response {
    axum::Json(json!({ "props": state.props_for(&bucket) })).into_response()
}

async fn set_props(
    State(state): State<Arc<FakeState>>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(Value::Object(mut envelope)) = serde_json::from_slice::<Value>(&body) else {
        return text(StatusCode::BAD_REQUEST, "body must be a JSON object\n");
    };
    let Some(Value::Object(props)) = envelope.remove("props") else {
        return text(StatusCode::BAD_REQUEST, "missing props\n");
    };
    if let Some(n_val) = props.get("n_val") {
        let n_val = n_val.as_u64().unwrap_or(0);
        if n_val == 0 {
            return text(StatusCode::BAD_REQUEST, "n_val must be a positive integer\n");
        }
        let max = state.max_n_val.load(Ordering::SeqCst);
        if max > 0 && n_val > max {
            return text(
                StatusCode::BAD_REQUEST,
                format!("n_val {n_val} exceeds the ring limit of {max}\n"),
            );
        }
    }
    state
        .props
        .lock()
        .unwrap()
        .entry(bucket)
        .or_default()
        .extend(props);
    StatusCode::NO_CONTENT.into_response()
}

async fn reset_props(State(state): State<Arc<FakeState>>, Path(bucket): Path<String>) -> Response {
    state.props.lock().unwrap().remove(&bucket);
    StatusCode::NO_CONTENT.into_response()
}

// -- Counters ------------------------------------------------------------------

const COUNTER_REQUIRES_SIBLINGS: &str = "Counters require bucket property 'allow_mult=true'\n";

async fn get_counter(
    State(state): State<Arc<FakeState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    if !state.allow_mult(&bucket) {
        return text(StatusCode::CONFLICT, COUNTER_REQUIRES_SIBLINGS);
    }
    match state.counters.lock().unwrap().get(&(bucket, key)) {
        Some(value) => text(StatusCode::OK, value.to_string()),
        None => text(StatusCode::NOT_FOUND, "not found\n"),
    }
}

async fn update_counter(
    State(state): State<Arc<FakeState>>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if !state.allow_mult(&bucket) {
        return text(StatusCode::CONFLICT, COUNTER_REQUIRES_SIBLINGS);
    }
    let Some(delta) = std::str::from_utf8(&body)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
    else {
        return text(StatusCode::BAD_REQUEST, "counter delta must be an integer\n");
    };
    *state
        .counters
        .lock()
        .unwrap()
        .entry((bucket, key))
        .or_insert(0) += delta;
    StatusCode::NO_CONTENT.into_response()
}
