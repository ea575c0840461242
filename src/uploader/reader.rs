// 分片读取
//
// 两种模式读取文件的 [offset, offset+len) 窗口：
// - 缓冲模式：一次性读入内存，Content-Length 精确
// - 流式模式：按 64KB 子块按需读取，内存占用低，但连接卡住的概率更高

use crate::drive::{local_read_error, RequestBody, SegmentStream};
use crate::error::{DriveError, DriveResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;

/// 流式读取的子块大小: 64KB
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// 分片请求体
pub enum SegmentBody {
    Buffered(Bytes),
    Streaming { len: u64, stream: SegmentStream },
}

impl SegmentBody {
    pub fn len(&self) -> u64 {
        match self {
            SegmentBody::Buffered(bytes) => bytes.len() as u64,
            SegmentBody::Streaming { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_request_body(self) -> RequestBody {
        match self {
            SegmentBody::Buffered(bytes) => RequestBody::Bytes(bytes),
            SegmentBody::Streaming { len, stream } => RequestBody::Stream { len, stream },
        }
    }
}

/// 分片数据来源
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// 本地文件路径
    fn path(&self) -> &Path;

    /// 读取字节窗口
    async fn read(&self, range: Range<u64>) -> DriveResult<SegmentBody>;
}

/// 按模式选择分片读取方式
pub fn source_for(path: &Path, streaming: bool) -> Arc<dyn SegmentSource> {
    if streaming {
        Arc::new(StreamingSource::new(path))
    } else {
        Arc::new(BufferedSource::new(path))
    }
}

async fn open_at(path: &Path, offset: u64) -> DriveResult<File> {
    let mut file = File::open(path)
        .await
        .map_err(|e| DriveError::local_io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DriveError::local_io(path, e))?;
    Ok(file)
}

/// 缓冲模式
#[derive(Debug, Clone)]
pub struct BufferedSource {
    path: PathBuf,
}

impl BufferedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SegmentSource for BufferedSource {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self, range: Range<u64>) -> DriveResult<SegmentBody> {
        let len = (range.end - range.start) as usize;
        let mut file = open_at(&self.path, range.start).await?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| DriveError::local_io(&self.path, e))?;
        Ok(SegmentBody::Buffered(Bytes::from(buffer)))
    }
}

/// 流式模式
#[derive(Debug, Clone)]
pub struct StreamingSource {
    path: PathBuf,
}

impl StreamingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SegmentSource for StreamingSource {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self, range: Range<u64>) -> DriveResult<SegmentBody> {
        let len = range.end - range.start;
        let file = open_at(&self.path, range.start).await?;
        let stream = BoundedStream {
            inner: ReaderStream::with_capacity(file.take(len), STREAM_CHUNK_SIZE),
            remaining: len,
        };
        Ok(SegmentBody::Streaming {
            len,
            stream: Box::pin(stream),
        })
    }
}

/// 不超过指定长度的字节流；文件提前结束时产生 UnexpectedEof
///
/// 产生的错误都带 LocalReadError 标记
struct BoundedStream {
    inner: ReaderStream<Take<File>>,
    remaining: u64,
}

impl Stream for BoundedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.remaining == 0 {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.remaining = 0;
                Poll::Ready(Some(Err(local_read_error(e))))
            }
            Poll::Ready(None) => {
                let missing = self.remaining;
                self.remaining = 0;
                Poll::Ready(Some(Err(local_read_error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("文件提前结束，还差 {} 字节", missing),
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
