// 下载引擎
//
// 单个网盘文件下载到本地：
// 1. 获取元数据（目录拒绝下载，本地已存在拒绝覆盖）
// 2. 写入 {目标}.part，已有 .part 时用 Range 请求续传
// 3. 连接中断时按指数退避从当前位置续传
// 4. 校验大小和 SHA-1 后重命名为目标文件

use crate::common::{format_bytes, sha1_file};
use crate::drive::DriveItem;
use crate::error::DriveError;
use crate::uploader::engine::{calculate_backoff_delay, ProgressEvent, WorkerContext};
use futures::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// 下载成功的摘要
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub item: DriveItem,
    pub local_path: PathBuf,
    pub bytes: u64,
    /// 续传起点（.part 文件中已有的字节数）
    pub resumed_from: u64,
}

/// 下载失败
#[derive(Debug)]
pub struct DownloadFailure {
    pub remote_path: String,
    pub local_path: PathBuf,
    pub error: DriveError,
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "下载 '{}' 到 '{}' 失败: {}",
            self.remote_path,
            self.local_path.display(),
            self.error
        )
    }
}

impl std::error::Error for DownloadFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 临时文件路径: `{目标}.part`
pub fn part_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// 单个文件的下载工作者
pub struct DownloadWorker {
    ctx: WorkerContext,
    remote_path: String,
    local_path: PathBuf,
}

impl DownloadWorker {
    /// # 参数
    /// * `ctx` - 共享依赖
    /// * `remote_path` - 网盘文件路径
    /// * `local_path` - 本地目标文件路径
    pub fn new(ctx: WorkerContext, remote_path: &str, local_path: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            remote_path: crate::common::normalize_remote_path(remote_path),
            local_path: local_path.into(),
        }
    }

    fn failure(&self, error: DriveError) -> DownloadFailure {
        DownloadFailure {
            remote_path: self.remote_path.clone(),
            local_path: self.local_path.clone(),
            error,
        }
    }

    /// 执行下载
    pub async fn run(&self) -> Result<DownloadSummary, DownloadFailure> {
        let result = self.run_inner().await.map_err(|e| self.failure(e));
        match &result {
            Ok(summary) => info!(
                "✓ 下载完成: '{}' -> '{}' ({})",
                self.remote_path,
                self.local_path.display(),
                format_bytes(summary.bytes)
            ),
            Err(failure) => error!("{}", failure),
        }
        result
    }

    async fn run_inner(&self) -> Result<DownloadSummary, DriveError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(DriveError::Cancelled);
        }

        let item = self.ctx.client.metadata(&self.remote_path).await?;
        if item.is_dir() {
            return Err(DriveError::IsADirectory(self.remote_path.clone()));
        }
        if fs::try_exists(&self.local_path).await.unwrap_or(false) {
            return Err(DriveError::AlreadyExists(
                self.local_path.display().to_string(),
            ));
        }
        let download_url = item.download_url.clone().ok_or_else(|| {
            DriveError::Protocol(format!("'{}' 没有下载地址", self.remote_path))
        })?;

        if let Some(parent) = self.local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DriveError::local_io(parent, e))?;
        }

        let part = part_path(&self.local_path);
        let mut offset = match fs::metadata(&part).await {
            Ok(meta) if meta.len() <= item.size => meta.len(),
            Ok(_) => {
                warn!("{:?} 比远程文件大，重新下载", part);
                fs::remove_file(&part)
                    .await
                    .map_err(|e| DriveError::local_io(&part, e))?;
                0
            }
            Err(_) => 0,
        };
        let resumed_from = offset;
        if offset > 0 {
            info!(
                "续传 '{}': 已有 {}",
                self.remote_path,
                format_bytes(offset)
            );
        }

        let max_retries = self.ctx.config.download_max_retries;
        let mut retries = 0u32;
        while offset < item.size {
            match self.fetch_from(&download_url, &part, offset, item.size).await {
                Ok(new_offset) => {
                    if new_offset > offset {
                        retries = 0;
                    }
                    offset = new_offset;
                    if offset >= item.size {
                        break;
                    }
                    // 服务端提前结束响应
                    warn!("'{}' 响应提前结束 ({}/{})", self.remote_path, offset, item.size);
                }
                Err(FetchError::Interrupted(new_offset, e)) => {
                    if new_offset > offset {
                        retries = 0;
                    }
                    offset = new_offset;
                    warn!("'{}' 下载中断 ({}/{}): {}", self.remote_path, offset, item.size, e);
                }
                Err(FetchError::Fatal(e)) => return Err(e),
            }

            if retries >= max_retries {
                return Err(DriveError::RetriesExhausted {
                    attempts: retries + 1,
                    last: format!("下载在 {}/{} 字节处中断", offset, item.size),
                });
            }
            let delay = calculate_backoff_delay(
                retries,
                self.ctx.config.retry_backoff_initial,
                self.ctx.config.retry_backoff_max,
                None,
            );
            retries += 1;
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Err(DriveError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if item.size == 0 {
            // 0 字节文件不发请求，直接创建
            fs::File::create(&part)
                .await
                .map_err(|e| DriveError::local_io(&part, e))?;
        }

        self.verify(&item, &part).await?;

        fs::rename(&part, &self.local_path)
            .await
            .map_err(|e| DriveError::local_io(&self.local_path, e))?;

        Ok(DownloadSummary {
            bytes: item.size,
            item,
            local_path: self.local_path.clone(),
            resumed_from,
        })
    }

    /// 从 offset 开始下载一次，返回写入后的偏移
    async fn fetch_from(
        &self,
        url: &str,
        part: &Path,
        offset: u64,
        total: u64,
    ) -> Result<u64, FetchError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(FetchError::Fatal(DriveError::Cancelled));
        }

        let mut response = match self
            .ctx
            .client
            .download_stream(url, offset, self.ctx.config.download_timeout)
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_retryable() => return Err(FetchError::Interrupted(offset, e)),
            Err(e) => return Err(FetchError::Fatal(e)),
        };

        // 服务端忽略 Range 时从头写
        let mut offset = offset;
        let append = offset > 0 && response.status == 206;
        if offset > 0 && !append {
            debug!("服务端不支持续传，从头下载 '{}'", self.remote_path);
            offset = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part)
            .await
            .map_err(|e| FetchError::Fatal(DriveError::local_io(part, e)))?;

        while let Some(chunk) = response.body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush()
                        .await
                        .map_err(|e| FetchError::Fatal(DriveError::local_io(part, e)))?;
                    return Err(FetchError::Interrupted(offset, DriveError::Transport(e)));
                }
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Fatal(DriveError::local_io(part, e)))?;
            offset += chunk.len() as u64;

            if let Some(tx) = &self.ctx.progress {
                let _ = tx.send(ProgressEvent::Progress {
                    remote_path: self.remote_path.clone(),
                    confirmed: offset.min(total),
                    total,
                });
            }
            if self.ctx.cancel.is_cancelled() {
                file.flush()
                    .await
                    .map_err(|e| FetchError::Fatal(DriveError::local_io(part, e)))?;
                info!("'{}' 下载已中断，保留 {:?} 以便续传", self.remote_path, part);
                return Err(FetchError::Fatal(DriveError::Cancelled));
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Fatal(DriveError::local_io(part, e)))?;
        Ok(offset)
    }

    /// 校验大小与 SHA-1，不一致时删除 .part
    async fn verify(&self, item: &DriveItem, part: &Path) -> Result<(), DriveError> {
        let local_size = fs::metadata(part)
            .await
            .map_err(|e| DriveError::local_io(part, e))?
            .len();
        if local_size != item.size {
            let _ = fs::remove_file(part).await;
            return Err(DriveError::CorruptedDownload(format!(
                "'{}' 大小不一致: 远程 {}, 本地 {}",
                self.remote_path, item.size, local_size
            )));
        }

        if !self.ctx.config.compare_hash {
            return Ok(());
        }
        let Some(remote) = item.sha1() else {
            warn!("'{}' 服务端未返回 SHA-1，跳过校验", self.remote_path);
            return Ok(());
        };
        let local = sha1_file(part).await?;
        if local != remote {
            let _ = fs::remove_file(part).await;
            return Err(DriveError::CorruptedDownload(format!(
                "'{}' SHA-1 不一致: 远程 {}, 本地 {}",
                self.remote_path, remote, local
            )));
        }
        Ok(())
    }
}

/// 单次下载请求的错误
enum FetchError {
    /// 可续传（附带已写入后的偏移）
    Interrupted(u64, DriveError),
    Fatal(DriveError),
}
