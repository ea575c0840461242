// HTTP 传输层
//
// 上传引擎只依赖 HttpTransport trait：
// - 生产环境使用 ReqwestTransport
// - 测试使用内存中的模拟网盘
//
// 每个请求都带独立的截止时间，reqwest 的超时错误统一映射为 TransportError::Timeout
//
// 流式请求体的本地读取错误带 LocalReadError 标记，与网络错误区分开

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use reqwest::{Client, Method};
use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// 分片请求体的字节流
///
/// reqwest 的 Body::wrap_stream 要求 Send + Sync
pub type SegmentStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// 本地数据源读取失败
///
/// 流式请求体产生的错误经 reqwest/hyper 包装后只剩错误链，靠这个类型识别
#[derive(Debug, Error)]
#[error("本地读取失败: {0}")]
pub struct LocalReadError(#[source] pub io::Error);

/// 给请求体流的错误打上本地读取标记，保留原始 ErrorKind
pub fn local_read_error(err: io::Error) -> io::Error {
    if is_local_read_error(&err) {
        return err;
    }
    io::Error::new(err.kind(), LocalReadError(err))
}

/// 错误本身或其错误链中是否带本地读取标记
pub fn is_local_read_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<LocalReadError>() {
            return true;
        }
        // io::Error::source 会跳过自定义错误本身，需要用 get_ref 取出
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(|io_err| io_err.get_ref()) {
            if inner.is::<LocalReadError>() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// 请求体
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
    /// 流式请求体，长度已知（用于 Content-Length）
    Stream { len: u64, stream: SegmentStream },
}

impl RequestBody {
    /// 请求体长度
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Json(_) => None,
            RequestBody::Stream { len, .. } => Some(*len),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Json(v) => write!(f, "Json({})", v),
            RequestBody::Stream { len, .. } => write!(f, "Stream({} bytes)", len),
        }
    }
}

/// HTTP 请求
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// 整个请求（含响应体）的截止时间
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.header("Content-Type", "application/json")
            .body(RequestBody::Json(value))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 查找请求头（不区分大小写）
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP 响应（响应体已完整读取）
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Retry-After 响应头（秒）
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("Retry-After")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// 流式响应（用于下载）
pub struct StreamingResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl StreamingResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 读取完整响应体（非 2xx 时用于解析错误信息）
    pub async fn into_response(mut self) -> Result<HttpResponse, TransportError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.body.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(HttpResponse {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(body),
        })
    }
}

/// HTTP 传输抽象
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// 发送请求并读取完整响应
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// GET 请求并以流的形式返回响应体
    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<StreamingResponse, TransportError>;
}

/// 基于 reqwest 的传输实现
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 创建传输层
    ///
    /// # 参数
    /// * `connect_timeout` - 连接超时
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(concat!("onedrive-rust/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        timeout: Option<Duration>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

/// reqwest 错误分类
///
/// 只有错误链中带 LocalReadError 的才算请求体读取失败；
/// 读取响应体时连接断开属于网络错误
fn map_reqwest_error(err: reqwest::Error, timeout: Option<Duration>) -> TransportError {
    if is_local_read_error(&err) {
        TransportError::Body(err.to_string())
    } else if err.is_timeout() {
        TransportError::Timeout(timeout.unwrap_or_default())
    } else if err.is_connect() || err.is_body() || err.is_decode() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        debug!("{} {}", method, crate::common::strip_query_param(&url, "access_token"));

        let mut builder = self.build(method, &url, &headers, timeout);
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Json(value) => builder.body(value.to_string()),
            RequestBody::Stream { stream, .. } => {
                builder.body(reqwest::Body::wrap_stream(stream))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> Result<StreamingResponse, TransportError> {
        let response = self
            .build(Method::GET, url, &headers, timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(e, timeout)))
            .boxed();

        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriveError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 读到请求头结束为止
    async fn read_request_head(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    #[test]
    fn test_local_read_marker_survives_wrapping() {
        let marked = local_read_error(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(marked.kind(), io::ErrorKind::UnexpectedEof);
        assert!(is_local_read_error(&marked));

        let boxed: Box<dyn StdError + Send + Sync> = Box::new(marked);
        assert!(is_local_read_error(boxed.as_ref()));

        let plain = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(!is_local_read_error(&plain));
    }

    #[tokio::test]
    async fn test_local_stream_failure_maps_to_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut sink = [0u8; 4096];
                while let Ok(n) = socket.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            }
        });

        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Err(local_read_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "local file truncated",
            ))),
        ];
        let request = HttpRequest::new(Method::PUT, format!("http://{}/session", addr))
            .header("Content-Length", "100")
            .header("Content-Range", "bytes 0-99/100")
            .body(RequestBody::Stream {
                len: 100,
                stream: Box::pin(futures::stream::iter(chunks)),
            })
            .timeout(Duration::from_secs(5));

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport.send(request).await.unwrap_err();
        assert!(matches!(err, TransportError::Body(_)), "got {:?}", err);
        assert!(!DriveError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn test_truncated_response_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                read_request_head(&mut socket).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 1000\r\n\r\n{\"nextExpected")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let request = HttpRequest::new(Method::GET, format!("http://{}/session", addr))
            .timeout(Duration::from_secs(5));
        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport.send(request).await.unwrap_err();
        assert!(
            matches!(err, TransportError::Connect(_) | TransportError::Other(_)),
            "got {:?}",
            err
        );
        assert!(DriveError::from(err).is_retryable());
    }

    #[test]
    fn test_request_builder_headers() {
        let request = HttpRequest::new(Method::PUT, "https://upload.test/s")
            .header("Content-Range", "bytes 0-9/10")
            .body(RequestBody::Bytes(Bytes::from_static(b"0123456789")))
            .timeout(Duration::from_secs(5));

        assert_eq!(request.header_value("content-range"), Some("bytes 0-9/10"));
        assert_eq!(request.body.len(), Some(10));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_retry_after_header() {
        let response = HttpResponse {
            status: 429,
            headers: vec![("retry-after".to_string(), "7".to_string())],
            body: Bytes::new(),
        };
        assert_eq!(response.retry_after(), Some(Duration::from_secs(7)));
        assert!(!response.is_success());
    }
}
