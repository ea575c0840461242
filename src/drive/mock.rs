// 测试用的内存网盘
//
// 实现 HttpTransport，按 URL 路由模拟 OneDrive 的元数据、目录、上传会话、复制和下载接口，
// 并支持按 (路径, 分片起点) 注入故障。

use crate::common::{join_remote, normalize_remote_path, remote_basename, remote_parent, sha1_hex};
use crate::drive::auth::StaticTokenProvider;
use crate::drive::client::DriveClient;
use crate::drive::transport::{
    is_local_read_error, HttpRequest, HttpResponse, HttpTransport, RequestBody, StreamingResponse,
};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 分片请求的注入故障
#[derive(Debug, Clone)]
pub enum Fault {
    /// 返回指定状态码（带通用错误体）
    Status(u16),
    /// 返回指定状态码和错误码
    ErrorCode(u16, &'static str),
    /// 返回 Retry-After 响应头
    RetryAfter(u16, u64),
    /// 传输超时
    Timeout,
    /// 连接被重置
    ConnectionReset,
    /// 服务端已接收数据，但客户端看到超时
    AcceptThenTimeout,
    /// 会话失效，返回 404
    ExpireSession,
    /// 卡住指定时长（用于截止时间测试）
    Stall(Duration),
    /// 丢弃数据并返回 202，期望起点为给定值
    Rewind(u64),
}

/// 一次分片 PUT 的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub path: String,
    pub start: u64,
    pub end: u64,
    pub total: u64,
    pub timeout: Option<Duration>,
    pub authorized: bool,
}

#[derive(Debug)]
struct FakeSession {
    path: String,
    total: u64,
    received: Vec<u8>,
    expired: bool,
}

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    folders: BTreeSet<String>,
    sessions: HashMap<String, FakeSession>,
    next_id: u64,
    faults: HashMap<(String, u64), VecDeque<Fault>>,
    reject_create: HashMap<String, (u16, &'static str)>,
    wrong_hash: HashSet<String>,
    download_cuts: HashMap<String, VecDeque<usize>>,
    copy_jobs: HashMap<String, (String, String, u32)>,
    puts: Vec<PutRecord>,
    sessions_created: usize,
    page_size: usize,
    download_requests: Vec<(String, Option<String>)>,
}

/// 内存网盘
pub struct MockTransport {
    state: Mutex<State>,
    put_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn respond(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(body.to_string()),
    }
}

fn error_response(status: u16, code: &str) -> HttpResponse {
    respond(
        status,
        json!({ "error": { "code": code, "message": format!("mock error {}", code) } }),
    )
}

fn item_id(path: &str) -> String {
    format!("mock!{}", path)
}

impl MockTransport {
    pub const ENDPOINT: &'static str = "https://graph.test/v1.0/me";
    pub const UPLOAD_BASE: &'static str = "https://upload.test/session/";
    pub const DOWNLOAD_BASE: &'static str = "https://download.test/";
    pub const MONITOR_BASE: &'static str = "https://monitor.test/";

    pub fn new() -> Arc<Self> {
        let mut state = State {
            page_size: 200,
            ..Default::default()
        };
        state.folders.insert(String::new());
        Arc::new(Self {
            state: Mutex::new(state),
            put_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// 使用固定令牌的客户端
    pub fn client(self: &Arc<Self>) -> Arc<DriveClient> {
        Arc::new(DriveClient::new(
            self.clone(),
            Arc::new(StaticTokenProvider::new("test-token")),
            Self::ENDPOINT,
        ))
    }

    // ==================== 数据准备 ====================

    pub fn add_folder(&self, path: &str) {
        let path = normalize_remote_path(path);
        let mut state = self.state.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = join_remote(&current, part);
            state.folders.insert(current.clone());
        }
    }

    pub fn add_file(&self, path: &str, content: Vec<u8>) {
        let path = normalize_remote_path(path);
        self.add_folder(&remote_parent(&path));
        self.state.lock().files.insert(path, content);
    }

    pub fn inject(&self, path: &str, start: u64, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry((normalize_remote_path(path), start))
            .or_default()
            .push_back(fault);
    }

    pub fn reject_create(&self, path: &str, status: u16, code: &'static str) {
        self.state
            .lock()
            .reject_create
            .insert(normalize_remote_path(path), (status, code));
    }

    /// 返回错误的 SHA-1
    pub fn corrupt_hash(&self, path: &str) {
        self.state.lock().wrong_hash.insert(normalize_remote_path(path));
    }

    /// 下载在发送 n 字节后断开（每次调用消耗一个）
    pub fn cut_download(&self, path: &str, after_bytes: usize) {
        self.state
            .lock()
            .download_cuts
            .entry(normalize_remote_path(path))
            .or_default()
            .push_back(after_bytes);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock() = delay;
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.lock().page_size = size.max(1);
    }

    /// 预先创建一个已接收部分数据的会话，返回会话地址
    pub fn open_session(&self, path: &str, total: u64, received: Vec<u8>) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("s{}", state.next_id);
        state.sessions.insert(
            id.clone(),
            FakeSession {
                path: normalize_remote_path(path),
                total,
                received,
                expired: false,
            },
        );
        format!("{}{}", Self::UPLOAD_BASE, id)
    }

    // ==================== 断言辅助 ====================

    pub fn has_file(&self, path: &str) -> bool {
        self.state
            .lock()
            .files
            .contains_key(&normalize_remote_path(path))
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.state
            .lock()
            .folders
            .contains(&normalize_remote_path(path))
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(&normalize_remote_path(path))
            .cloned()
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.state.lock().puts.clone()
    }

    pub fn puts_for(&self, path: &str) -> Vec<PutRecord> {
        let path = normalize_remote_path(path);
        self.puts().into_iter().filter(|p| p.path == path).collect()
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().sessions_created
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn download_requests(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().download_requests.clone()
    }

    // ==================== 内部实现 ====================

    fn item_json(state: &State, path: &str) -> Option<Value> {
        if let Some(content) = state.files.get(path) {
            let mut sha1 = sha1_hex(content).to_ascii_uppercase();
            if state.wrong_hash.contains(path) {
                sha1 = "0".repeat(40);
            }
            Some(json!({
                "id": item_id(path),
                "name": remote_basename(path),
                "size": content.len(),
                "webUrl": format!("https://onedrive.test/{}", path),
                "file": { "mimeType": "application/octet-stream", "hashes": { "sha1Hash": sha1 } },
                "@microsoft.graph.downloadUrl": format!("{}{}", Self::DOWNLOAD_BASE, path),
            }))
        } else if state.folders.contains(path) {
            let prefix = if path.is_empty() {
                String::new()
            } else {
                format!("{}/", path)
            };
            let child_count = Self::child_paths(state, &prefix).len();
            let name = if path.is_empty() {
                "root".to_string()
            } else {
                remote_basename(path)
            };
            Some(json!({
                "id": item_id(path),
                "name": name,
                "size": 0,
                "folder": { "childCount": child_count },
            }))
        } else {
            None
        }
    }

    fn child_paths(state: &State, prefix: &str) -> Vec<String> {
        let direct = |p: &String| {
            !p.is_empty() && p.starts_with(prefix) && !p[prefix.len()..].contains('/')
        };
        state
            .folders
            .iter()
            .filter(|p| direct(p))
            .chain(state.files.keys().filter(|p| direct(p)))
            .cloned()
            .collect()
    }

    fn path_from_id(id: &str) -> Option<String> {
        id.strip_prefix("mock!").map(str::to_string)
    }

    fn body_json(body: &RequestBody) -> Value {
        match body {
            RequestBody::Json(v) => v.clone(),
            RequestBody::Bytes(b) => serde_json::from_slice(b).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    async fn body_bytes(body: RequestBody) -> Result<Vec<u8>, TransportError> {
        match body {
            RequestBody::Empty => Ok(Vec::new()),
            RequestBody::Bytes(b) => Ok(b.to_vec()),
            RequestBody::Json(v) => Ok(v.to_string().into_bytes()),
            RequestBody::Stream { mut stream, .. } => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    // 与 ReqwestTransport 一致：只有带本地读取标记的错误才算请求体错误
                    let chunk = chunk.map_err(|e| {
                        if is_local_read_error(&e) {
                            TransportError::Body(e.to_string())
                        } else {
                            TransportError::Other(e.to_string())
                        }
                    })?;
                    out.extend_from_slice(&chunk);
                }
                Ok(out)
            }
        }
    }

    fn remove_tree(state: &mut State, path: &str) {
        let prefix = format!("{}/", path);
        state.files.retain(|p, _| p != path && !p.starts_with(&prefix));
        state.folders.retain(|p| p != path && !p.starts_with(&prefix));
    }

    fn copy_tree(state: &mut State, src: &str, dst: &str) {
        let prefix = format!("{}/", src);
        let files: Vec<(String, Vec<u8>)> = state
            .files
            .iter()
            .filter(|(p, _)| *p == src || p.starts_with(&prefix))
            .map(|(p, c)| (format!("{}{}", dst, &p[src.len()..]), c.clone()))
            .collect();
        let folders: Vec<String> = state
            .folders
            .iter()
            .filter(|p| *p == src || p.starts_with(&prefix))
            .map(|p| format!("{}{}", dst, &p[src.len()..]))
            .collect();
        state.files.extend(files);
        state.folders.extend(folders);
    }

    fn route_drive(&self, request: &HttpRequest, body: Value) -> HttpResponse {
        let (url, query) = match request.url.split_once('?') {
            Some((u, q)) => (u.to_string(), Some(q.to_string())),
            None => (request.url.clone(), None),
        };
        if request.header_value("Authorization") != Some("Bearer test-token") {
            return error_response(401, "unauthenticated");
        }

        let rest = &url[format!("{}/drive/root", Self::ENDPOINT).len()..];
        let (path, action) = if let Some(tail) = rest.strip_prefix(":/") {
            match tail.split_once(":/") {
                Some((p, a)) => (p.to_string(), Some(a.to_string())),
                None => (tail.to_string(), None),
            }
        } else {
            (String::new(), rest.strip_prefix('/').map(str::to_string))
        };
        let path = normalize_remote_path(
            &urlencoding::decode(&path)
                .map(|p| p.into_owned())
                .unwrap_or(path),
        );
        let replace = query
            .as_deref()
            .map(|q| q.contains("conflictBehavior=replace"))
            .unwrap_or(false);

        let mut state = self.state.lock();
        match (request.method.as_str(), action.as_deref()) {
            ("GET", None) => match Self::item_json(&state, &path) {
                Some(item) => respond(200, item),
                None => error_response(404, "itemNotFound"),
            },
            ("GET", Some("children")) => {
                if !state.folders.contains(&path) {
                    return if state.files.contains_key(&path) {
                        respond(200, json!({ "value": [] }))
                    } else {
                        error_response(404, "itemNotFound")
                    };
                }
                let prefix = if path.is_empty() {
                    String::new()
                } else {
                    format!("{}/", path)
                };
                let skip: usize = query
                    .as_deref()
                    .and_then(|q| q.strip_prefix("skip="))
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let children = Self::child_paths(&state, &prefix);
                let page: Vec<Value> = children
                    .iter()
                    .skip(skip)
                    .take(state.page_size)
                    .filter_map(|p| Self::item_json(&state, p))
                    .collect();
                let mut response = json!({ "value": page });
                if skip + state.page_size < children.len() {
                    response["@odata.nextLink"] =
                        json!(format!("{}?skip={}", url, skip + state.page_size));
                }
                respond(200, response)
            }
            ("POST", Some("children")) => {
                if state.files.contains_key(&path) {
                    return error_response(403, "accessDenied");
                }
                if !state.folders.contains(&path) {
                    return error_response(404, "itemNotFound");
                }
                let name = body["name"].as_str().unwrap_or_default().to_string();
                let target = join_remote(&path, &name);
                if state.folders.contains(&target) || state.files.contains_key(&target) {
                    return error_response(409, "nameAlreadyExists");
                }
                state.folders.insert(target.clone());
                respond(201, Self::item_json(&state, &target).unwrap_or(Value::Null))
            }
            ("POST", Some("createUploadSession")) => {
                if let Some((status, code)) = state.reject_create.get(&path).copied() {
                    return error_response(status, code);
                }
                if !state.folders.contains(&remote_parent(&path)) {
                    return error_response(404, "itemNotFound");
                }
                if state.files.contains_key(&path) || state.folders.contains(&path) {
                    return error_response(409, "nameAlreadyExists");
                }
                state.next_id += 1;
                state.sessions_created += 1;
                let id = format!("s{}", state.next_id);
                state.sessions.insert(
                    id.clone(),
                    FakeSession {
                        path: path.clone(),
                        total: 0,
                        received: Vec::new(),
                        expired: false,
                    },
                );
                let expires = chrono::Utc::now() + chrono::Duration::days(1);
                respond(
                    200,
                    json!({
                        "uploadUrl": format!("{}{}", Self::UPLOAD_BASE, id),
                        "expirationDateTime": expires.to_rfc3339(),
                        "nextExpectedRanges": ["0-"],
                    }),
                )
            }
            ("DELETE", None) => {
                if Self::item_json(&state, &path).is_none() {
                    return error_response(404, "itemNotFound");
                }
                Self::remove_tree(&mut state, &path);
                HttpResponse {
                    status: 204,
                    headers: Vec::new(),
                    body: Bytes::new(),
                }
            }
            ("PATCH", None) | ("POST", Some("copy")) => {
                if Self::item_json(&state, &path).is_none() {
                    return error_response(404, "itemNotFound");
                }
                let parent = body["parentReference"]["id"]
                    .as_str()
                    .and_then(Self::path_from_id)
                    .unwrap_or_default();
                let name = body["name"].as_str().unwrap_or_default().to_string();
                let dst = join_remote(&parent, &name);
                if Self::item_json(&state, &dst).is_some() {
                    if !replace {
                        return error_response(409, "nameAlreadyExists");
                    }
                    Self::remove_tree(&mut state, &dst);
                }
                if request.method == Method::PATCH {
                    Self::copy_tree(&mut state, &path, &dst);
                    Self::remove_tree(&mut state, &path);
                    respond(200, Self::item_json(&state, &dst).unwrap_or(Value::Null))
                } else {
                    state.next_id += 1;
                    let id = format!("c{}", state.next_id);
                    state.copy_jobs.insert(id.clone(), (path, dst, 0));
                    HttpResponse {
                        status: 202,
                        headers: vec![(
                            "Location".to_string(),
                            format!("{}{}", Self::MONITOR_BASE, id),
                        )],
                        body: Bytes::new(),
                    }
                }
            }
            _ => error_response(400, "invalidRequest"),
        }
    }

    fn route_monitor(&self, id: &str) -> HttpResponse {
        let mut state = self.state.lock();
        let Some((src, dst, polls)) = state.copy_jobs.get(id).cloned() else {
            return error_response(404, "itemNotFound");
        };
        if polls == 0 {
            state.copy_jobs.insert(id.to_string(), (src, dst, 1));
            return respond(202, json!({ "status": "inProgress", "percentageComplete": 50.0 }));
        }
        state.copy_jobs.remove(id);
        Self::copy_tree(&mut state, &src, &dst);
        respond(
            200,
            json!({ "status": "completed", "resourceId": item_id(&dst) }),
        )
    }

    fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
        let spec = value.strip_prefix("bytes ")?;
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?, total.parse().ok()?))
    }

    async fn route_session(
        &self,
        id: &str,
        request: HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        match request.method.as_str() {
            "GET" => {
                let state = self.state.lock();
                return Ok(match state.sessions.get(id) {
                    Some(s) if !s.expired => respond(
                        200,
                        json!({ "nextExpectedRanges": [format!("{}-", s.received.len())] }),
                    ),
                    _ => error_response(404, "itemNotFound"),
                });
            }
            "DELETE" => {
                self.state.lock().sessions.remove(id);
                return Ok(HttpResponse {
                    status: 204,
                    headers: Vec::new(),
                    body: Bytes::new(),
                });
            }
            "PUT" => {}
            _ => return Ok(error_response(400, "invalidRequest")),
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let Some((start, end, total)) = request
            .header_value("Content-Range")
            .and_then(Self::parse_content_range)
        else {
            return Ok(error_response(400, "invalidRange"));
        };

        let session_path = self
            .state
            .lock()
            .sessions
            .get(id)
            .map(|s| s.path.clone())
            .unwrap_or_default();
        self.state.lock().puts.push(PutRecord {
            path: session_path.clone(),
            start,
            end: end + 1,
            total,
            timeout: request.timeout,
            authorized: request.header_value("Authorization").is_some(),
        });

        let delay = *self.put_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fault = self
            .state
            .lock()
            .faults
            .get_mut(&(session_path, start))
            .and_then(|q| q.pop_front());
        let data = Self::body_bytes(request.body).await?;

        let mut accept_then_timeout = false;
        match fault {
            Some(Fault::Status(status)) => return Ok(error_response(status, "generalException")),
            Some(Fault::ErrorCode(status, code)) => {
                return Ok(respond(
                    status,
                    json!({ "error": { "code": "invalidRange", "message": "mock",
                        "innererror": { "code": code } } }),
                ))
            }
            Some(Fault::RetryAfter(status, secs)) => {
                let mut response = error_response(status, "throttled");
                response
                    .headers
                    .push(("Retry-After".to_string(), secs.to_string()));
                return Ok(response);
            }
            Some(Fault::Timeout) => {
                return Err(TransportError::Timeout(request.timeout.unwrap_or_default()))
            }
            Some(Fault::ConnectionReset) => {
                return Err(TransportError::Connect("connection reset by peer".to_string()))
            }
            Some(Fault::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                return Err(TransportError::Timeout(request.timeout.unwrap_or_default()));
            }
            Some(Fault::ExpireSession) => {
                if let Some(session) = self.state.lock().sessions.get_mut(id) {
                    session.expired = true;
                }
            }
            Some(Fault::AcceptThenTimeout) => accept_then_timeout = true,
            Some(Fault::Rewind(next)) => {
                return Ok(respond(
                    202,
                    json!({ "nextExpectedRanges": [format!("{}-", next)] }),
                ))
            }
            None => {}
        }

        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(id) else {
            return Ok(error_response(404, "itemNotFound"));
        };
        if session.expired {
            return Ok(error_response(404, "itemNotFound"));
        }
        if session.total == 0 {
            session.total = total;
        }
        if data.len() as u64 != end + 1 - start || total != session.total {
            return Ok(error_response(400, "invalidRequest"));
        }
        let received = session.received.len() as u64;
        if start < received {
            return Ok(error_response(416, "invalidRange"));
        }
        if start > received {
            return Ok(error_response(400, "invalidRange"));
        }
        session.received.extend_from_slice(&data);

        let response = if session.received.len() as u64 == session.total {
            let session = state.sessions.remove(id).map(|s| (s.path, s.received));
            match session {
                Some((path, content)) if !state.files.contains_key(&path) => {
                    state.files.insert(path.clone(), content);
                    respond(201, Self::item_json(&state, &path).unwrap_or(Value::Null))
                }
                _ => error_response(409, "nameAlreadyExists"),
            }
        } else {
            respond(
                202,
                json!({ "nextExpectedRanges": [format!("{}-", session.received.len())] }),
            )
        };

        if accept_then_timeout {
            return Err(TransportError::Timeout(request.timeout.unwrap_or_default()));
        }
        Ok(response)
    }

    fn route_simple_upload(&self, request: &HttpRequest, data: Vec<u8>) -> HttpResponse {
        let (url, _) = request.url.split_once('?').unwrap_or((&request.url, ""));
        let rest = &url[format!("{}/drive/root:/", Self::ENDPOINT).len()..];
        let encoded = rest.strip_suffix(":/content").unwrap_or(rest);
        let path = normalize_remote_path(
            &urlencoding::decode(encoded)
                .map(|p| p.into_owned())
                .unwrap_or_default(),
        );
        let mut state = self.state.lock();
        if !state.folders.contains(&remote_parent(&path)) {
            return error_response(404, "itemNotFound");
        }
        if state.files.contains_key(&path) {
            return error_response(409, "nameAlreadyExists");
        }
        state.files.insert(path.clone(), data);
        respond(201, Self::item_json(&state, &path).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if let Some(id) = request.url.strip_prefix(Self::UPLOAD_BASE) {
            let id = id.to_string();
            return self.route_session(&id, request).await;
        }
        if let Some(id) = request.url.strip_prefix(Self::MONITOR_BASE) {
            return Ok(self.route_monitor(id));
        }
        if request.method == Method::PUT && request.url.contains(":/content") {
            if request.header_value("Authorization") != Some("Bearer test-token") {
                return Ok(error_response(401, "unauthenticated"));
            }
            let url_request = HttpRequest::new(Method::PUT, request.url.clone());
            let data = Self::body_bytes(request.body).await?;
            return Ok(self.route_simple_upload(&url_request, data));
        }
        if request.url.starts_with(Self::ENDPOINT) {
            let body = Self::body_json(&request.body);
            return Ok(self.route_drive(&request, body));
        }
        Err(TransportError::Connect(format!("unknown host: {}", request.url)))
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        _timeout: Option<Duration>,
    ) -> Result<StreamingResponse, TransportError> {
        let Some(path) = url.strip_prefix(Self::DOWNLOAD_BASE) else {
            return Err(TransportError::Connect(format!("unknown host: {}", url)));
        };
        let path = normalize_remote_path(path);
        let range = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Range"))
            .map(|(_, v)| v.clone());

        let mut state = self.state.lock();
        state.download_requests.push((path.clone(), range.clone()));
        let Some(content) = state.files.get(&path).cloned() else {
            let response = error_response(404, "itemNotFound");
            return Ok(StreamingResponse {
                status: 404,
                headers: response.headers,
                body: futures::stream::once(async move { Ok(response.body) }).boxed(),
            });
        };
        let offset = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
            .unwrap_or(0)
            .min(content.len());
        let cut = state.download_cuts.get_mut(&path).and_then(|q| q.pop_front());
        drop(state);

        let status = if offset > 0 { 206 } else { 200 };
        let remaining = content[offset..].to_vec();
        let chunks: Vec<Result<Bytes, TransportError>> = match cut {
            Some(n) if n < remaining.len() => vec![
                Ok(Bytes::copy_from_slice(&remaining[..n])),
                Err(TransportError::Other("connection closed".to_string())),
            ],
            _ => remaining
                .chunks(4096)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
        };

        Ok(StreamingResponse {
            status,
            headers: Vec::new(),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}
