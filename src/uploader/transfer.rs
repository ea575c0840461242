// 单个分片的传输与结果分类
//
// 一次 PUT 的结果归为四类：
// - Advanced: 服务端确认的字节数前进（或保持不变）
// - Completed: 最后一个分片被接收，服务端返回新建的网盘项
// - Retryable: 网络错误、超时、5xx、限流，重发同一分片
// - Fatal: 会话失效、认证失败、本地读取失败、服务端进度倒退、其余 4xx

use crate::drive::{DriveClient, DriveItem, HttpResponse, UploadSessionStatus};
use crate::error::{DriveError, TransportError};
use crate::uploader::chunk::Segment;
use crate::uploader::reader::SegmentSource;
use crate::uploader::session::{confirmed_from_ranges, UploadSession};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// 可重试的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    /// 截止时间内无响应（连接静默失效）
    Stalled(Duration),
    /// 连接失败或被重置
    Connection(String),
    /// 服务端临时错误（408 / 429 / 5xx）
    ServerError {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    /// 服务端未接收该分片（202 返回的期望起点没有前进）
    NotAccepted { expected: u64 },
    /// 服务端分片校验失败（416 fragmentRowCountCheckFailed）
    FragmentCheckFailed,
}

impl RetryReason {
    /// 服务端要求的等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RetryReason::ServerError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Stalled(timeout) => write!(f, "上传卡住（{:?} 内无响应）", timeout),
            RetryReason::Connection(msg) => write!(f, "连接错误: {}", msg),
            RetryReason::ServerError {
                status, message, ..
            } => write!(f, "HTTP {}: {}", status, message),
            RetryReason::NotAccepted { expected } => {
                write!(f, "分片未被接收，服务端期望从 {} 开始", expected)
            }
            RetryReason::FragmentCheckFailed => write!(f, "服务端分片校验失败"),
        }
    }
}

/// 分片传输结果
#[derive(Debug)]
pub enum TransferOutcome {
    Advanced(u64),
    Completed(Box<DriveItem>),
    Retryable(RetryReason),
    Fatal(DriveError),
}

/// 发送一个分片并分类结果
///
/// # 参数
/// * `client` - 网盘客户端
/// * `session` - 上传会话（不会被修改，由调用方根据结果更新）
/// * `segment` - 要发送的分片
/// * `source` - 分片数据来源
/// * `timeout` - 本次请求的截止时间
pub async fn send_segment(
    client: &DriveClient,
    session: &UploadSession,
    segment: &Segment,
    source: &dyn SegmentSource,
    timeout: Duration,
) -> TransferOutcome {
    if session.is_complete() {
        return TransferOutcome::Fatal(DriveError::Protocol(
            "会话已完成，不能继续发送分片".to_string(),
        ));
    }

    let total = session.expected_total_bytes();
    let body = match source.read(segment.range.clone()).await {
        Ok(body) => body,
        Err(e) => return TransferOutcome::Fatal(e),
    };

    let content_range = segment.content_range(total);
    debug!(
        "发送分片 #{}: {} ({} 字节)",
        segment.index,
        content_range,
        body.len()
    );

    let put = client.put_segment(
        session.upload_url(),
        content_range,
        body.into_request_body(),
        timeout,
    );
    // 传输层自身的超时之外再加一层截止时间，保证卡住的连接一定会被放弃
    let result = match tokio::time::timeout(timeout, put).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };

    match result {
        Ok(response) => classify_response(client, session, segment, response).await,
        Err(TransportError::Timeout(_)) => {
            warn!(
                "分片 #{} 上传卡住: {:?} 内无响应，将重试",
                segment.index, timeout
            );
            TransferOutcome::Retryable(RetryReason::Stalled(timeout))
        }
        Err(TransportError::Connect(msg)) | Err(TransportError::Other(msg)) => {
            warn!("分片 #{} 连接错误: {}", segment.index, msg);
            TransferOutcome::Retryable(RetryReason::Connection(msg))
        }
        Err(TransportError::Body(msg)) => TransferOutcome::Fatal(DriveError::local_io(
            source.path(),
            std::io::Error::other(msg),
        )),
    }
}

/// 按状态码分类响应
async fn classify_response(
    client: &DriveClient,
    session: &UploadSession,
    segment: &Segment,
    response: HttpResponse,
) -> TransferOutcome {
    let total = session.expected_total_bytes();

    match response.status {
        200 | 201 => match response.json::<DriveItem>() {
            Ok(item) => TransferOutcome::Completed(Box::new(item)),
            Err(e) => TransferOutcome::Fatal(DriveError::Protocol(format!(
                "上传完成响应解析失败: {}",
                e
            ))),
        },
        202 => {
            let status = match response.json::<UploadSessionStatus>() {
                Ok(status) => status,
                Err(e) => {
                    return TransferOutcome::Fatal(DriveError::Protocol(format!(
                        "分片响应解析失败: {}",
                        e
                    )))
                }
            };
            match confirmed_from_ranges(&status.next_expected_ranges, total) {
                Ok(None) => TransferOutcome::Advanced(total),
                Ok(Some(next)) if next < session.confirmed_bytes() => {
                    progress_went_back(session, next)
                }
                Ok(Some(next)) if next > segment.offset() => TransferOutcome::Advanced(next),
                Ok(Some(next)) => {
                    TransferOutcome::Retryable(RetryReason::NotAccepted { expected: next })
                }
                Err(e) => TransferOutcome::Fatal(e),
            }
        }
        416 => {
            let fragment_check = DriveClient::api_error(&response)
                .map(|e| e.has_code("fragmentRowCountCheckFailed"))
                .unwrap_or(false);
            if fragment_check {
                warn!("分片 #{} 服务端校验失败，将重试", segment.index);
                return TransferOutcome::Retryable(RetryReason::FragmentCheckFailed);
            }
            // 该范围已被接收（例如上次响应丢失），以服务端记录为准
            debug!("分片 #{} 返回 416，查询会话状态", segment.index);
            query_confirmed(client, session).await
        }
        404 => TransferOutcome::Fatal(DriveError::SessionExpired(format!(
            "分片 #{} 返回 404",
            segment.index
        ))),
        401 => TransferOutcome::Fatal(DriveClient::error_from_response(
            &response,
            session.upload_url(),
        )),
        408 | 429 | 500..=599 => {
            let message = DriveClient::api_error(&response)
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| response.text());
            TransferOutcome::Retryable(RetryReason::ServerError {
                status: response.status,
                message,
                retry_after: response.retry_after(),
            })
        }
        _ => TransferOutcome::Fatal(DriveClient::error_from_response(
            &response,
            session.upload_url(),
        )),
    }
}

/// 查询服务端已确认的字节数
async fn query_confirmed(client: &DriveClient, session: &UploadSession) -> TransferOutcome {
    let total = session.expected_total_bytes();
    match client.query_upload_session(session.upload_url()).await {
        Ok(status) => match confirmed_from_ranges(&status.next_expected_ranges, total) {
            Ok(Some(confirmed)) if confirmed < session.confirmed_bytes() => {
                progress_went_back(session, confirmed)
            }
            Ok(confirmed) => TransferOutcome::Advanced(confirmed.unwrap_or(total)),
            Err(e) => TransferOutcome::Fatal(e),
        },
        Err(e) if e.is_retryable() => TransferOutcome::Retryable(RetryReason::Connection(e.to_string())),
        Err(e) => TransferOutcome::Fatal(e),
    }
}

/// 服务端报告的已确认字节数小于本地记录，会话不可信
fn progress_went_back(session: &UploadSession, reported: u64) -> TransferOutcome {
    TransferOutcome::Fatal(DriveError::Protocol(format!(
        "服务端进度倒退: 已确认 {}，服务端报告 {}",
        session.confirmed_bytes(),
        reported
    )))
}
