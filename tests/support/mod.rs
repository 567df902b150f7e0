//! In-process stand-in for the backup backend.
//!
//! Serves the JSON API under `/v1` and the presigned PUT/GET targets on the
//! same listener. Every handler bumps a named counter so tests can assert
//! exactly which requests reached the network.

#![allow(dead_code)]

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use backup_transfer::services::{
    clock::{Clock, ManualClock},
    rate_limiter::RateLimiter,
    remote_storage::RemoteStorage,
    transfer_client::TransferClient,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::net::TcpListener;

pub const KIB: u64 = 1024;

#[derive(Default)]
struct Session {
    name: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
pub struct Backend {
    base: Mutex<String>,
    clock: ManualClock,
    next_id: Mutex<u32>,

    /// Finished backups by name.
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    sessions: Mutex<HashMap<String, Session>>,
    uploads: Mutex<HashMap<String, (String, Vec<u8>)>>,

    calls: Mutex<HashMap<&'static str, u32>>,

    /// Part number -> how many more PUTs of it are refused with 403.
    expired_parts: Mutex<HashMap<u32, u32>>,
    /// How many more single-shot upload PUTs answer 500.
    pub failing_upload_puts: Mutex<u32>,
    /// How many more presigned GETs are refused with 403.
    pub expired_gets: Mutex<u32>,
    /// `retry_after` for a 429 on the next verify-storage call.
    pub throttle_verify: Mutex<Option<u64>>,
    /// `range` parameters of every part-URL refetch.
    pub url_fetches: Mutex<Vec<String>>,
    /// Parts list of every completed multipart session.
    pub completions: Mutex<Vec<Vec<(u32, String)>>>,
    pub max_backups_seen: Mutex<Vec<u64>>,
    pub quota_total: Mutex<u64>,
}

impl Backend {
    pub fn calls(&self, name: &str) -> u32 {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    /// Single-shot uploads started but neither completed nor released.
    pub fn reserved_uploads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.uploads.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refuse the next `times` PUTs of `part` as expired.
    pub fn expire_part(&self, part: u32, times: u32) {
        self.expired_parts.lock().unwrap().insert(part, times);
    }

    fn refuse_as_expired(&self, part: u32) -> bool {
        let mut expired = self.expired_parts.lock().unwrap();
        match expired.get_mut(&part) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_one(counter: &Mutex<u32>) -> bool {
        let mut left = counter.lock().unwrap();
        if *left == 0 {
            return false;
        }
        *left -= 1;
        true
    }

    fn hit(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }

    fn id(&self, prefix: &str) -> String {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        format!("{prefix}-{next}")
    }

    fn base(&self) -> String {
        self.base.lock().unwrap().clone()
    }

    /// Presigned transfers take one simulated second each.
    fn tick(&self) {
        self.clock.advance(chrono::Duration::seconds(1));
    }

    fn part_urls(&self, session_id: &str, range: &str) -> BTreeMap<u32, String> {
        let (from, to) = range
            .split_once('-')
            .and_then(|(a, b)| Some((a.parse::<u32>().ok()?, b.parse::<u32>().ok()?)))
            .unwrap_or((1, 50));
        let base = self.base();
        (from..=to)
            .map(|n| (n, format!("{base}/presigned/part/{session_id}/{n}")))
            .collect()
    }
}

pub struct MockServer {
    pub backend: Arc<Backend>,
    pub api_url: String,
    pub clock: ManualClock,
}

impl MockServer {
    pub async fn start() -> Self {
        let backend = Arc::new(Backend::default());
        *backend.quota_total.lock().unwrap() = 1 << 30;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        *backend.base.lock().unwrap() = base.clone();

        let app = Router::new()
            .route("/v1/verify-storage", post(verify_storage))
            .route("/v1/website/upload", post(start_upload))
            .route("/v1/website/upload/{id}", post(complete_upload))
            .route("/v1/website/upload/{id}/{action}", post(release_upload))
            .route("/v1/website/multipart", post(start_multipart))
            .route(
                "/v1/website/multipart/{id}",
                get(fetch_part_urls).post(complete_multipart),
            )
            .route("/v1/website/direct_upload", post(direct_upload))
            .route("/v1/backups", get(list_backups).delete(delete_backups))
            .route("/v1/backups/{name}", get(backup_info).delete(delete_backup))
            .route("/v1/backups/{name}/download", get(download_target))
            .route("/presigned/upload/{id}", put(put_upload))
            .route("/presigned/part/{session}/{part}", put(put_part))
            .route("/presigned/object/{name}", get(get_object))
            .with_state(backend.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let clock = backend.clock.clone();
        Self {
            backend,
            api_url: format!("{base}/v1/"),
            clock,
        }
    }

    pub fn client(&self) -> TransferClient {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let limiter = Arc::new(RateLimiter::new(clock));
        TransferClient::new(&self.api_url, "test-token", Duration::from_secs(5), limiter).unwrap()
    }

    pub fn storage(&self, part_size: u64) -> RemoteStorage {
        RemoteStorage::new(self.client(), Arc::new(self.clock.clone()), part_size, 5)
    }
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

fn ok(data: Value) -> Response {
    Json(json!({ "success": true, "message": null, "data": data })).into_response()
}

fn refuse(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

fn with_etag(data: &[u8]) -> Response {
    let mut resp = StatusCode::OK.into_response();
    let etag = format!("\"{:x}\"", md5::compute(data));
    resp.headers_mut()
        .insert(header::ETAG, HeaderValue::from_str(&etag).unwrap());
    resp
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-token")
}

fn content_md5_matches(headers: &HeaderMap, body: &[u8]) -> bool {
    use base64::Engine as _;
    let expected = base64::engine::general_purpose::STANDARD.encode(md5::compute(body).0);
    headers.get("content-md5").and_then(|v| v.to_str().ok()) == Some(expected.as_str())
}

async fn verify_storage(State(b): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    b.hit("verify");
    if !authorized(&headers) {
        return refuse(StatusCode::UNAUTHORIZED, "bad token");
    }
    if let Some(retry_after) = b.throttle_verify.lock().unwrap().take() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "message": "slow down",
                "data": { "retry_after": retry_after },
            })),
        )
            .into_response();
    }
    let used: usize = b.objects.lock().unwrap().values().map(Vec::len).sum();
    let total = *b.quota_total.lock().unwrap();
    ok(json!({ "used": used, "total": total, "max_backups": 5 }))
}

#[derive(Deserialize)]
struct StartBody {
    name: String,
    #[serde(default)]
    range: Option<String>,
}

async fn start_upload(State(b): State<Arc<Backend>>, Json(body): Json<StartBody>) -> Response {
    b.hit("upload_start");
    let id = b.id("upload");
    b.uploads
        .lock()
        .unwrap()
        .insert(id.clone(), (body.name, Vec::new()));
    ok(json!({ "upload_id": id, "url": format!("{}/presigned/upload/{id}", b.base()) }))
}

async fn put_upload(
    State(b): State<Arc<Backend>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    b.hit("upload_put");
    if Backend::take_one(&b.failing_upload_puts) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if !content_md5_matches(&headers, &body) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let mut uploads = b.uploads.lock().unwrap();
    let Some(upload) = uploads.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    upload.1 = body.to_vec();
    b.tick();
    with_etag(&body)
}

#[derive(Deserialize)]
struct CompleteUpload {
    checksum: String,
    max_backups: u64,
}

async fn complete_upload(
    State(b): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(body): Json<CompleteUpload>,
) -> Response {
    b.hit("upload_complete");
    let Some((name, data)) = b.uploads.lock().unwrap().remove(&id) else {
        return refuse(StatusCode::NOT_FOUND, "unknown upload");
    };
    if format!("{:x}", md5::compute(&data)) != body.checksum {
        return refuse(StatusCode::UNPROCESSABLE_ENTITY, "checksum mismatch");
    }
    b.max_backups_seen.lock().unwrap().push(body.max_backups);
    b.objects.lock().unwrap().insert(name, data);
    ok(json!({}))
}

async fn release_upload(
    State(b): State<Arc<Backend>>,
    Path((id, action)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    match action.as_str() {
        "fail" => b.hit("release_fail"),
        "cancel" => b.hit("release_cancel"),
        _ => return refuse(StatusCode::NOT_FOUND, "unknown action"),
    }
    if body.get("job_id").and_then(Value::as_str).is_none_or(str::is_empty) {
        return refuse(StatusCode::BAD_REQUEST, "job_id required");
    }
    b.sessions.lock().unwrap().remove(&id);
    b.uploads.lock().unwrap().remove(&id);
    ok(json!({}))
}

async fn start_multipart(State(b): State<Arc<Backend>>, Json(body): Json<StartBody>) -> Response {
    b.hit("multipart_start");
    let id = b.id("session");
    b.sessions.lock().unwrap().insert(
        id.clone(),
        Session {
            name: body.name,
            parts: BTreeMap::new(),
        },
    );
    let range = body.range.unwrap_or_else(|| "1-50".into());
    ok(json!({ "session_id": id, "urls": b.part_urls(&id, &range) }))
}

async fn fetch_part_urls(
    State(b): State<Arc<Backend>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    b.hit("multipart_urls");
    if !b.sessions.lock().unwrap().contains_key(&id) {
        return refuse(StatusCode::NOT_FOUND, "unknown session");
    }
    let range = query.get("range").cloned().unwrap_or_default();
    b.url_fetches.lock().unwrap().push(range.clone());
    ok(json!({ "urls": b.part_urls(&id, &range) }))
}

async fn put_part(
    State(b): State<Arc<Backend>>,
    Path((session, part)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    b.hit("part_put");
    if b.refuse_as_expired(part) {
        return (StatusCode::FORBIDDEN, "Request has expired").into_response();
    }
    if !content_md5_matches(&headers, &body) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let mut sessions = b.sessions.lock().unwrap();
    let Some(session) = sessions.get_mut(&session) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    session.parts.insert(part, body.to_vec());
    b.tick();
    with_etag(&body)
}

#[derive(Deserialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Deserialize)]
struct CompleteMultipart {
    parts: Vec<CompletedPart>,
    max_backups: u64,
}

async fn complete_multipart(
    State(b): State<Arc<Backend>>,
    Path(id): Path<String>,
    Json(body): Json<CompleteMultipart>,
) -> Response {
    b.hit("multipart_complete");
    let Some(session) = b.sessions.lock().unwrap().remove(&id) else {
        return refuse(StatusCode::NOT_FOUND, "unknown session");
    };
    let mut data = Vec::new();
    for (i, part) in body.parts.iter().enumerate() {
        let Some(bytes) = session.parts.get(&part.part_number) else {
            return refuse(StatusCode::BAD_REQUEST, "missing part");
        };
        if part.part_number != i as u32 + 1 || format!("{:x}", md5::compute(bytes)) != part.etag {
            return refuse(StatusCode::BAD_REQUEST, "bad parts list");
        }
        data.extend_from_slice(bytes);
    }
    b.completions.lock().unwrap().push(
        body.parts
            .iter()
            .map(|p| (p.part_number, p.etag.clone()))
            .collect(),
    );
    b.max_backups_seen.lock().unwrap().push(body.max_backups);
    b.objects.lock().unwrap().insert(session.name, data);
    ok(json!({}))
}

async fn direct_upload(
    State(b): State<Arc<Backend>>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    b.hit("direct_upload");
    let Some(name) = query.get("name") else {
        return refuse(StatusCode::BAD_REQUEST, "name required");
    };
    b.objects.lock().unwrap().insert(name.clone(), body.to_vec());
    ok(json!({}))
}

async fn list_backups(State(b): State<Arc<Backend>>) -> Response {
    b.hit("list");
    let list: Vec<Value> = b
        .objects
        .lock()
        .unwrap()
        .iter()
        .map(|(name, data)| json!({ "name": name, "size": data.len() }))
        .collect();
    ok(json!(list))
}

#[derive(Deserialize)]
struct DeleteMany {
    names: Vec<String>,
}

async fn delete_backups(State(b): State<Arc<Backend>>, Json(body): Json<DeleteMany>) -> Response {
    b.hit("delete");
    let mut objects = b.objects.lock().unwrap();
    for name in body.names {
        objects.remove(&name);
    }
    ok(json!({}))
}

async fn backup_info(State(b): State<Arc<Backend>>, Path(name): Path<String>) -> Response {
    b.hit("info");
    match b.objects.lock().unwrap().get(&name) {
        Some(data) => ok(json!({ "name": name, "size": data.len(), "description": null })),
        None => refuse(StatusCode::NOT_FOUND, "backup not found"),
    }
}

async fn delete_backup(State(b): State<Arc<Backend>>, Path(name): Path<String>) -> Response {
    b.hit("delete");
    match b.objects.lock().unwrap().remove(&name) {
        Some(_) => ok(json!({})),
        None => refuse(StatusCode::NOT_FOUND, "backup not found"),
    }
}

async fn download_target(State(b): State<Arc<Backend>>, Path(name): Path<String>) -> Response {
    b.hit("download_target");
    let size = match b.objects.lock().unwrap().get(&name) {
        Some(data) => data.len(),
        None => return refuse(StatusCode::NOT_FOUND, "backup not found"),
    };
    ok(json!({ "url": format!("{}/presigned/object/{name}", b.base()), "size": size }))
}

async fn get_object(
    State(b): State<Arc<Backend>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    b.hit("get");
    if Backend::take_one(&b.expired_gets) {
        return (StatusCode::FORBIDDEN, "Request has expired").into_response();
    }
    let Some(data) = b.object(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    b.tick();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
    match range {
        Some((start, end)) if start < data.len() => {
            let end = end.min(data.len() - 1);
            (StatusCode::PARTIAL_CONTENT, data[start..=end].to_vec()).into_response()
        }
        Some(_) => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, data).into_response(),
    }
}
