// 错误类型定义
//
// 错误分类决定重试策略：
// - TransportFailure: 网络层错误，分片级可重试
// - 其余错误均为致命错误，直接终止当前文件的传输

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// HTTP 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// 超过请求截止时间仍未完成（连接静默失效）
    #[error("请求超时（{0:?} 内未完成）")]
    Timeout(Duration),
    /// 连接建立失败或连接被重置
    #[error("连接失败: {0}")]
    Connect(String),
    /// 请求体读取失败（流式上传时本地文件读取出错）
    #[error("请求体读取失败: {0}")]
    Body(String),
    /// 其他传输错误
    #[error("传输错误: {0}")]
    Other(String),
}

/// OneDrive 操作错误
#[derive(Debug, Error)]
pub enum DriveError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 服务端拒绝（4xx 语义错误）
    #[error("服务端拒绝请求: HTTP {status} {code}: {message}")]
    ServiceRejection {
        status: u16,
        code: String,
        message: String,
    },

    /// 上传会话已失效（过期或被服务端删除）
    #[error("上传会话已失效: {0}")]
    SessionExpired(String),

    #[error("本地文件读写失败 '{}': {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 认证失败，由凭证提供方负责刷新
    #[error("认证失败: {0}")]
    Auth(String),

    #[error("'{0}' 不存在")]
    NotFound(String),

    #[error("'{0}' 已存在")]
    AlreadyExists(String),

    #[error("'{0}' 是目录")]
    IsADirectory(String),

    #[error("'{0}' 不是目录")]
    NotADirectory(String),

    #[error("目录 '{0}' 不为空")]
    DirectoryNotEmpty(String),

    #[error("SHA-1 校验不一致: 本地 {local}, 远程 {remote}")]
    HashMismatch { local: String, remote: String },

    #[error("下载文件损坏: {0}")]
    CorruptedDownload(String),

    /// 响应格式不符合接口约定
    #[error("响应格式异常: {0}")]
    Protocol(String),

    #[error("操作已中断")]
    Cancelled,

    #[error("已尝试 {attempts} 次仍失败，最后一次错误: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl DriveError {
    /// 构造本地 I/O 错误
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DriveError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// 是否可在分片级重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriveError::Transport(
                TransportError::Timeout(_) | TransportError::Connect(_) | TransportError::Other(_)
            )
        )
    }
}

pub type DriveResult<T> = Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DriveError::from(TransportError::Timeout(Duration::from_secs(3))).is_retryable());
        assert!(DriveError::from(TransportError::Connect("reset".into())).is_retryable());
        assert!(!DriveError::from(TransportError::Body("eof".into())).is_retryable());
        assert!(!DriveError::SessionExpired("gone".into()).is_retryable());
        assert!(!DriveError::Auth("expired token".into()).is_retryable());
    }

    #[test]
    fn test_retries_exhausted_keeps_last_reason() {
        let err = DriveError::RetriesExhausted {
            attempts: 4,
            last: "HTTP 503".to_string(),
        };
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.to_string().contains('4'));
    }
}
