// OneDrive 客户端
//
// 封装单次调用的网盘操作（元数据、目录、删除、移动、复制）以及上传会话相关的原始请求。
// 这些操作本身不重试，重试策略由上传 / 下载工作者负责。

use crate::common::{normalize_remote_path, remote_basename, remote_parent};
use crate::drive::auth::TokenProvider;
use crate::drive::transport::{
    HttpRequest, HttpResponse, HttpTransport, RequestBody, StreamingResponse,
};
use crate::drive::types::{
    ApiError, ApiErrorBody, ChildrenPage, CopyStatus, DriveItem, ListResult, UploadSessionInfo,
    UploadSessionStatus,
};
use crate::error::{DriveError, DriveResult, TransportError};
use bytes::Bytes;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 复制任务状态轮询间隔
pub const DEFAULT_COPY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// OneDrive 客户端
#[derive(Clone)]
pub struct DriveClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<dyn TokenProvider>,
    /// API 入口，如 https://graph.microsoft.com/v1.0/me
    endpoint: String,
    /// 普通 API 请求超时
    request_timeout: Duration,
}

impl std::fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveClient")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// 路径逐段 URL 编码，保留分隔符
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

impl DriveClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `transport` - HTTP 传输层
    /// * `tokens` - 访问令牌提供方
    /// * `endpoint` - API 入口地址
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<dyn TokenProvider>,
        endpoint: impl Into<String>,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        info!("初始化 OneDrive 客户端: {}", endpoint);
        Self {
            transport,
            tokens,
            endpoint,
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// 网盘项 URL
    ///
    /// - 根目录: `{endpoint}/drive/root[/action]`
    /// - 其他: `{endpoint}/drive/root:/{path}[:/action]`
    pub fn item_url(&self, path: &str, action: Option<&str>) -> String {
        let path = normalize_remote_path(path);
        match (path.is_empty(), action) {
            (true, None) => format!("{}/drive/root", self.endpoint),
            (true, Some(action)) => format!("{}/drive/root/{}", self.endpoint, action),
            (false, None) => format!("{}/drive/root:/{}", self.endpoint, encode_path(&path)),
            (false, Some(action)) => format!(
                "{}/drive/root:/{}:/{}",
                self.endpoint,
                encode_path(&path),
                action
            ),
        }
    }

    /// 发送带令牌的 API 请求
    async fn call(&self, request: HttpRequest) -> DriveResult<HttpResponse> {
        let token = self.tokens.access_token().await?;
        let request = request
            .header("Authorization", format!("Bearer {}", token))
            .timeout(self.request_timeout);
        let response = self.transport.send(request).await?;
        debug!("HTTP {}: {}", response.status, response.text());
        Ok(response)
    }

    /// 将失败响应转换为错误
    pub fn error_from_response(response: &HttpResponse, path: &str) -> DriveError {
        match response.status {
            401 => DriveError::Auth(format!(
                "HTTP 401: {}",
                Self::api_error(response)
                    .map(|e| e.message)
                    .unwrap_or_else(|| response.text())
            )),
            404 => DriveError::NotFound(path.to_string()),
            status => {
                let (code, message) = match Self::api_error(response) {
                    Some(err) => (err.code, err.message),
                    None => (String::new(), response.text()),
                };
                DriveError::ServiceRejection {
                    status,
                    code,
                    message,
                }
            }
        }
    }

    /// 解析错误响应体
    pub fn api_error(response: &HttpResponse) -> Option<ApiError> {
        response.json::<ApiErrorBody>().ok().map(|body| body.error)
    }

    fn parse<T: serde::de::DeserializeOwned>(response: &HttpResponse, what: &str) -> DriveResult<T> {
        response
            .json::<T>()
            .map_err(|e| DriveError::Protocol(format!("{}响应解析失败: {}", what, e)))
    }

    /// 获取文件或目录的元数据
    pub async fn metadata(&self, path: &str) -> DriveResult<DriveItem> {
        let path = normalize_remote_path(path);
        debug!("获取元数据: '{}'", path);
        let response = self
            .call(HttpRequest::new(Method::GET, self.item_url(&path, None)))
            .await?;
        match response.status {
            200 => Self::parse(&response, "元数据"),
            _ => Err(Self::error_from_response(&response, &path)),
        }
    }

    /// 文件或目录是否存在
    pub async fn exists(&self, path: &str) -> DriveResult<bool> {
        match self.metadata(path).await {
            Ok(_) => Ok(true),
            Err(DriveError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 路径是否为目录
    pub async fn is_dir(&self, path: &str) -> DriveResult<bool> {
        match self.metadata(path).await {
            Ok(item) => Ok(item.is_dir()),
            Err(DriveError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 列出目录的子项（自动跟随 @odata.nextLink 分页）
    ///
    /// 路径为文件时返回空列表
    pub async fn children(&self, path: &str) -> DriveResult<Vec<DriveItem>> {
        let path = normalize_remote_path(path);
        let mut url = self.item_url(&path, Some("children"));
        let mut items = Vec::new();

        loop {
            let response = self.call(HttpRequest::new(Method::GET, url)).await?;
            if response.status != 200 {
                return Err(Self::error_from_response(&response, &path));
            }
            let page: ChildrenPage = Self::parse(&response, "目录列表")?;
            items.extend(page.value);
            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!("'{}' 共 {} 个子项", path, items.len());
        Ok(items)
    }

    /// 文件返回自身，目录返回子项
    pub async fn list(&self, path: &str) -> DriveResult<ListResult> {
        let item = self.metadata(path).await?;
        if item.is_dir() {
            Ok(ListResult::Directory(self.children(path).await?))
        } else {
            Ok(ListResult::File(item))
        }
    }

    /// 创建单个目录（父目录必须存在）
    async fn create_folder(&self, path: &str, exist_ok: bool) -> DriveResult<DriveItem> {
        let parent = remote_parent(path);
        let name = remote_basename(path);
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });

        let response = self
            .call(HttpRequest::new(Method::POST, self.item_url(&parent, Some("children"))).json(body))
            .await?;

        match response.status {
            200 | 201 => {
                info!("已创建目录: '{}'", path);
                Self::parse(&response, "创建目录")
            }
            409 => {
                let existing = self.metadata(path).await?;
                if !existing.is_dir() {
                    Err(DriveError::NotADirectory(path.to_string()))
                } else if exist_ok {
                    Ok(existing)
                } else {
                    Err(DriveError::AlreadyExists(path.to_string()))
                }
            }
            403 => Err(DriveError::NotADirectory(parent)),
            _ => Err(Self::error_from_response(&response, &parent)),
        }
    }

    /// 递归创建目录
    ///
    /// # 参数
    /// * `path` - 目录路径
    /// * `exist_ok` - 目录已存在时是否视为成功
    ///
    /// # 返回
    /// 创建（或已存在）的目录元数据
    pub async fn makedirs(&self, path: &str, exist_ok: bool) -> DriveResult<DriveItem> {
        let path = normalize_remote_path(path);
        if path.is_empty() {
            return if exist_ok {
                self.metadata("").await
            } else {
                Err(DriveError::AlreadyExists("/".to_string()))
            };
        }

        match self.create_folder(&path, exist_ok).await {
            Err(DriveError::NotFound(_)) => {
                // 父目录不存在：从最浅层开始逐级创建
                let parts: Vec<&str> = path.split('/').collect();
                for depth in 1..parts.len() {
                    self.create_folder(&parts[..depth].join("/"), true).await?;
                }
                self.create_folder(&path, exist_ok).await
            }
            other => other,
        }
    }

    /// 创建目录（不递归，父目录必须存在）
    pub async fn mkdir(&self, path: &str) -> DriveResult<DriveItem> {
        let path = normalize_remote_path(path);
        let parent = remote_parent(&path);
        let parent_item = self.metadata(&parent).await?;
        if !parent_item.is_dir() {
            return Err(DriveError::NotADirectory(parent));
        }
        self.create_folder(&path, false).await
    }

    /// 删除文件或目录
    ///
    /// # 参数
    /// * `recursive` - 是否允许删除目录
    pub async fn remove(&self, path: &str, recursive: bool) -> DriveResult<()> {
        let path = normalize_remote_path(path);
        if path.is_empty() {
            return Err(DriveError::ServiceRejection {
                status: 400,
                code: "invalidRequest".to_string(),
                message: "不能删除根目录".to_string(),
            });
        }

        let item = self.metadata(&path).await?;
        if item.is_dir() && !recursive {
            return Err(DriveError::IsADirectory(path));
        }

        let response = self
            .call(HttpRequest::new(Method::DELETE, self.item_url(&path, None)))
            .await?;
        match response.status {
            200 | 204 => {
                info!("已删除: '{}'", path);
                Ok(())
            }
            _ => Err(Self::error_from_response(&response, &path)),
        }
    }

    /// 删除空目录
    pub async fn rmdir(&self, path: &str) -> DriveResult<()> {
        let path = normalize_remote_path(path);
        let item = self.metadata(&path).await?;
        match item.folder {
            None => Err(DriveError::NotADirectory(path)),
            Some(folder) if folder.child_count > 0 => Err(DriveError::DirectoryNotEmpty(path)),
            Some(_) => self.remove(&path, true).await,
        }
    }

    /// 目标父目录引用
    async fn parent_reference(&self, dst: &str) -> DriveResult<serde_json::Value> {
        let parent = remote_parent(dst);
        let parent_item = self.metadata(&parent).await?;
        if !parent_item.is_dir() {
            return Err(DriveError::NotADirectory(parent));
        }
        Ok(json!({ "id": parent_item.id }))
    }

    fn conflict_behavior(overwrite: bool) -> &'static str {
        if overwrite {
            "replace"
        } else {
            "fail"
        }
    }

    /// 移动（或重命名）文件或目录
    pub async fn move_item(&self, src: &str, dst: &str, overwrite: bool) -> DriveResult<DriveItem> {
        let src = normalize_remote_path(src);
        let dst = normalize_remote_path(dst);
        let body = json!({
            "parentReference": self.parent_reference(&dst).await?,
            "name": remote_basename(&dst),
        });
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            self.item_url(&src, None),
            Self::conflict_behavior(overwrite)
        );

        let response = self
            .call(HttpRequest::new(Method::PATCH, url).json(body))
            .await?;
        match response.status {
            200 => {
                info!("已移动: '{}' -> '{}'", src, dst);
                Self::parse(&response, "移动")
            }
            409 => Err(DriveError::AlreadyExists(dst)),
            _ => Err(Self::error_from_response(&response, &src)),
        }
    }

    /// 复制文件或目录并等待服务端完成
    ///
    /// 复制是服务端异步任务：请求返回 202 和 Location 监控地址，轮询直到完成
    pub async fn copy(
        &self,
        src: &str,
        dst: &str,
        overwrite: bool,
        poll_interval: Duration,
    ) -> DriveResult<DriveItem> {
        let src = normalize_remote_path(src);
        let dst = normalize_remote_path(dst);
        let body = json!({
            "parentReference": self.parent_reference(&dst).await?,
            "name": remote_basename(&dst),
        });
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            self.item_url(&src, Some("copy")),
            Self::conflict_behavior(overwrite)
        );

        let response = self
            .call(HttpRequest::new(Method::POST, url).json(body))
            .await?;
        if response.status == 409 {
            return Err(DriveError::AlreadyExists(dst));
        }
        if response.status != 202 {
            return Err(Self::error_from_response(&response, &src));
        }

        let monitor_url = response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| DriveError::Protocol("复制请求未返回 Location 监控地址".to_string()))?;

        info!("复制任务已提交: '{}' -> '{}'", src, dst);
        self.monitor_copy(&monitor_url, &dst, poll_interval).await
    }

    /// 轮询复制任务（监控地址无需令牌）
    async fn monitor_copy(
        &self,
        monitor_url: &str,
        dst: &str,
        poll_interval: Duration,
    ) -> DriveResult<DriveItem> {
        loop {
            let response = self
                .transport
                .send(HttpRequest::new(Method::GET, monitor_url).timeout(self.request_timeout))
                .await?;

            if !(response.is_success() || response.status == 303) {
                return Err(Self::error_from_response(&response, dst));
            }

            // 完成后监控地址可能直接重定向到新建的网盘项
            let status = response.json::<CopyStatus>().ok();
            let finished = match &status {
                Some(s) if s.status == "completed" => true,
                Some(s) if s.status == "failed" => {
                    return Err(DriveError::ServiceRejection {
                        status: response.status,
                        code: "copyFailed".to_string(),
                        message: format!("复制到 '{}' 失败", dst),
                    });
                }
                Some(s) if s.status.is_empty() => response.json::<DriveItem>().is_ok(),
                Some(s) => {
                    debug!(
                        "复制进行中: {} ({:?}%)",
                        s.status,
                        s.percentage_complete
                    );
                    false
                }
                None => false,
            };

            if finished {
                info!("复制完成: '{}'", dst);
                return self.metadata(dst).await;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// 创建上传会话
    ///
    /// 冲突策略为 fail：目标已存在时返回 AlreadyExists
    pub async fn create_upload_session(&self, path: &str) -> DriveResult<UploadSessionInfo> {
        let path = normalize_remote_path(path);
        let body = json!({
            "item": { "@microsoft.graph.conflictBehavior": "fail" }
        });

        let response = self
            .call(
                HttpRequest::new(Method::POST, self.item_url(&path, Some("createUploadSession")))
                    .json(body),
            )
            .await?;

        match response.status {
            200 | 201 => {
                let info: UploadSessionInfo = Self::parse(&response, "上传会话")?;
                debug!("已创建上传会话: '{}', 过期时间 {:?}", path, info.expiration_date_time);
                Ok(info)
            }
            409 => Err(DriveError::AlreadyExists(path)),
            404 => Err(DriveError::NotFound(remote_parent(&path))),
            _ => Err(Self::error_from_response(&response, &path)),
        }
    }

    /// 查询上传会话状态（会话地址已预授权，不带令牌）
    pub async fn query_upload_session(&self, upload_url: &str) -> DriveResult<UploadSessionStatus> {
        let response = self
            .transport
            .send(HttpRequest::new(Method::GET, upload_url).timeout(self.request_timeout))
            .await?;

        match response.status {
            200 => Self::parse(&response, "上传会话状态"),
            404 => Err(DriveError::SessionExpired(
                "查询会话状态返回 404".to_string(),
            )),
            _ => Err(Self::error_from_response(&response, upload_url)),
        }
    }

    /// 向上传会话发送一个分片（原始响应，由调用方分类）
    pub async fn put_segment(
        &self,
        upload_url: &str,
        content_range: String,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let len = body.len().unwrap_or(0);
        let request = HttpRequest::new(Method::PUT, upload_url)
            .header("Content-Range", content_range)
            .header("Content-Length", len.to_string())
            .body(body)
            .timeout(timeout);
        self.transport.send(request).await
    }

    /// 直接上传小文件（用于 0 字节文件，服务端不接受空分片）
    pub async fn upload_small(&self, path: &str, content: Bytes) -> DriveResult<DriveItem> {
        let path = normalize_remote_path(path);
        let url = format!(
            "{}?@microsoft.graph.conflictBehavior=fail",
            self.item_url(&path, Some("content"))
        );

        let response = self
            .call(
                HttpRequest::new(Method::PUT, url)
                    .header("Content-Type", "application/octet-stream")
                    .body(RequestBody::Bytes(content)),
            )
            .await?;

        match response.status {
            200 | 201 => Self::parse(&response, "上传"),
            409 => Err(DriveError::AlreadyExists(path)),
            404 => Err(DriveError::NotFound(remote_parent(&path))),
            _ => Err(Self::error_from_response(&response, &path)),
        }
    }

    /// 以流的形式下载（预签名地址，不带令牌）
    ///
    /// # 参数
    /// * `offset` - 起始偏移，大于 0 时发送 Range 请求（续传）
    pub async fn download_stream(
        &self,
        download_url: &str,
        offset: u64,
        timeout: Duration,
    ) -> DriveResult<StreamingResponse> {
        let mut headers = Vec::new();
        if offset > 0 {
            headers.push(("Range".to_string(), format!("bytes={}-", offset)));
        }
        let response = self
            .transport
            .get_stream(download_url, headers, Some(timeout))
            .await?;

        if response.status == 200 || response.status == 206 {
            Ok(response)
        } else {
            let status = response.status;
            let full = response.into_response().await?;
            warn!("下载请求失败: HTTP {}", status);
            Err(Self::error_from_response(&full, download_url))
        }
    }
}
