// 上传引擎
//
// 单个文件的上传状态机：
//   Created → SessionEstablished → Transferring → {Succeeded, Failed}
//
// - 会话创建 / 续传（已保存会话 + 服务端状态）
// - 分片严格按偏移顺序发送，可重试错误重发同一分片（指数退避）
// - 会话失效后可重新创建会话
// - 完成后校验 SHA-1

use crate::common::{format_bytes, sha1_file};
use crate::config::WorkerPoolConfig;
use crate::drive::{DriveClient, DriveItem};
use crate::error::DriveError;
use crate::uploader::chunk::SegmentPlan;
use crate::uploader::reader::{source_for, SegmentSource};
use crate::uploader::session::{
    confirmed_from_ranges, SavedSession, SavedSessionStore, UploadSession,
};
use crate::uploader::transfer::{send_segment, RetryReason, TransferOutcome};
use bytes::Bytes;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =====================================================
// 重试退避
// =====================================================

/// 计算指数退避延迟
///
/// # 延迟序列（initial = 1s, max = 30s）
/// - retry_count=0: 1s
/// - retry_count=1: 2s
/// - retry_count=2: 4s
/// - 最大: 30s
///
/// 服务端给出 Retry-After 时以其为准（同样受最大值限制）
pub fn calculate_backoff_delay(
    retry_count: u32,
    initial: Duration,
    max: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(wait) = retry_after {
        return wait.min(max);
    }
    let factor = 2u32.saturating_pow(retry_count);
    initial.saturating_mul(factor).min(max)
}

/// 退避延迟加 0~10% 随机抖动
fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    delay + delay.mul_f64(jitter)
}

// =====================================================
// 状态与结果
// =====================================================

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Created,
    SessionEstablished,
    Transferring,
    Succeeded,
    Failed,
}

/// 失败阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    /// 本地文件检查 / 哈希计算
    LocalCheck,
    /// 创建上传会话
    SessionCreation,
    /// 第 index 个分片（从 1 开始），共 count 个
    Segment { index: usize, count: usize },
    /// 0 字节文件直接上传
    SimpleUpload,
    /// 上传完成后的校验
    Verification,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureStage::LocalCheck => write!(f, "本地文件检查"),
            FailureStage::SessionCreation => write!(f, "创建上传会话"),
            FailureStage::Segment { index, count } => write!(f, "分片 {}/{}", index, count),
            FailureStage::SimpleUpload => write!(f, "直接上传"),
            FailureStage::Verification => write!(f, "完整性校验"),
        }
    }
}

/// 上传失败
#[derive(Debug)]
pub struct WorkerFailure {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub stage: FailureStage,
    pub error: DriveError,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "上传 '{}' 到 '{}' 失败（{}）: {}",
            self.local_path.display(),
            self.remote_path,
            self.stage,
            self.error
        )
    }
}

impl std::error::Error for WorkerFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 上传成功的摘要
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub item: DriveItem,
    pub bytes: u64,
    /// 续传起点（新会话为 0）
    pub resumed_from: u64,
    /// 会话重建次数
    pub session_restarts: u32,
}

/// 进度事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StateChanged {
        remote_path: String,
        state: UploadState,
    },
    Progress {
        remote_path: String,
        confirmed: u64,
        total: u64,
    },
}

// =====================================================
// 工作者上下文
// =====================================================

/// 上传工作者的共享依赖
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Arc<DriveClient>,
    pub config: Arc<WorkerPoolConfig>,
    /// 已保存会话（None 表示不持久化）
    pub sessions: Option<Arc<SavedSessionStore>>,
    /// 同时运行的工作者数（用于计算分片截止时间）
    pub concurrent_workers: usize,
    pub cancel: CancellationToken,
    pub progress: Option<UnboundedSender<ProgressEvent>>,
}

impl WorkerContext {
    pub fn new(client: Arc<DriveClient>, config: Arc<WorkerPoolConfig>) -> Self {
        Self {
            client,
            concurrent_workers: config.max_concurrent_workers,
            config,
            sessions: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_sessions(mut self, store: Arc<SavedSessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_concurrency(mut self, concurrent_workers: usize) -> Self {
        self.concurrent_workers = concurrent_workers;
        self
    }

    /// 单个分片的截止时间
    pub fn segment_timeout(&self) -> Duration {
        self.config.segment_timeout(self.concurrent_workers)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

// =====================================================
// 上传工作者
// =====================================================

/// 单个文件的上传工作者
pub struct UploadWorker {
    ctx: WorkerContext,
    local_path: PathBuf,
    remote_path: String,
    state: UploadState,
    transitions: Vec<UploadState>,
    /// 每个分片索引的尝试次数
    segment_attempts: BTreeMap<usize, u32>,
}

impl UploadWorker {
    /// # 参数
    /// * `ctx` - 共享依赖
    /// * `local_path` - 本地文件
    /// * `remote_path` - 网盘目标路径（完整文件路径）
    pub fn new(ctx: WorkerContext, local_path: impl Into<PathBuf>, remote_path: &str) -> Self {
        Self {
            ctx,
            local_path: local_path.into(),
            remote_path: crate::common::normalize_remote_path(remote_path),
            state: UploadState::Created,
            transitions: vec![UploadState::Created],
            segment_attempts: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// 经历过的全部状态（按顺序）
    pub fn transitions(&self) -> &[UploadState] {
        &self.transitions
    }

    /// 指定分片（从 0 开始）的尝试次数
    pub fn segment_attempts(&self, index: usize) -> u32 {
        self.segment_attempts.get(&index).copied().unwrap_or(0)
    }

    /// 全部分片请求次数
    pub fn total_attempts(&self) -> u32 {
        self.segment_attempts.values().sum()
    }

    fn transition(&mut self, next: UploadState) {
        if self.state == next {
            return;
        }
        info!("[{}] 状态: {:?} -> {:?}", self.remote_path, self.state, next);
        self.state = next;
        self.transitions.push(next);
        self.ctx.emit(ProgressEvent::StateChanged {
            remote_path: self.remote_path.clone(),
            state: next,
        });
    }

    fn failure(&self, stage: FailureStage, error: DriveError) -> WorkerFailure {
        WorkerFailure {
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            stage,
            error,
        }
    }

    /// 执行上传
    ///
    /// # 上传流程
    /// 1. 检查本地文件，计算 SHA-1（启用校验时）
    /// 2. 0 字节文件直接上传
    /// 3. 建立会话（优先续传已保存的会话）
    /// 4. 逐个发送分片
    /// 5. 校验并清理已保存的会话
    pub async fn run(&mut self) -> Result<UploadSummary, WorkerFailure> {
        let result = self.run_inner().await;
        match &result {
            Ok(summary) => {
                self.transition(UploadState::Succeeded);
                info!(
                    "✓ 上传完成: '{}' -> '{}' ({})",
                    self.local_path.display(),
                    self.remote_path,
                    format_bytes(summary.bytes)
                );
            }
            Err(failure) => {
                self.transition(UploadState::Failed);
                error!("{}", failure);
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<UploadSummary, WorkerFailure> {
        let metadata = tokio::fs::metadata(&self.local_path)
            .await
            .map_err(|e| self.failure(FailureStage::LocalCheck, DriveError::local_io(&self.local_path, e)))?;
        if !metadata.is_file() {
            let err = std::io::Error::new(std::io::ErrorKind::InvalidInput, "不是普通文件");
            return Err(self.failure(
                FailureStage::LocalCheck,
                DriveError::local_io(&self.local_path, err),
            ));
        }
        if self.ctx.cancel.is_cancelled() {
            return Err(self.failure(FailureStage::LocalCheck, DriveError::Cancelled));
        }

        let size = metadata.len();
        let file_sha1 = if self.ctx.config.compare_hash {
            Some(
                sha1_file(&self.local_path)
                    .await
                    .map_err(|e| self.failure(FailureStage::LocalCheck, e))?,
            )
        } else {
            None
        };

        info!(
            "开始上传: '{}' -> '{}' ({})",
            self.local_path.display(),
            self.remote_path,
            format_bytes(size)
        );

        if size == 0 {
            return self.upload_empty(file_sha1.as_deref()).await;
        }

        let plan = SegmentPlan::new(size, self.ctx.config.chunk_size_bytes);
        let source = source_for(&self.local_path, self.ctx.config.streaming_mode);

        let mut session = self.establish_session(size, file_sha1.as_deref(), true).await?;
        let resumed_from = session.confirmed_bytes();
        let mut restarts = 0u32;

        let item = loop {
            match self.transfer_segments(&mut session, &plan, source.as_ref()).await {
                Ok(item) => break item,
                Err(failure) if matches!(failure.error, DriveError::SessionExpired(_)) => {
                    self.discard_saved(file_sha1.as_deref());
                    if restarts >= self.ctx.config.max_session_restarts {
                        return Err(failure);
                    }
                    restarts += 1;
                    warn!(
                        "[{}] 上传会话已失效，重新创建会话 ({}/{})",
                        self.remote_path, restarts, self.ctx.config.max_session_restarts
                    );
                    session = self.establish_session(size, file_sha1.as_deref(), false).await?;
                }
                Err(failure) => return Err(failure),
            }
        };

        self.verify(&item, file_sha1.as_deref())?;
        self.discard_saved(file_sha1.as_deref());

        Ok(UploadSummary {
            item,
            bytes: size,
            resumed_from,
            session_restarts: restarts,
        })
    }

    /// 0 字节文件：服务端不接受空分片，直接 PUT 空内容
    async fn upload_empty(&mut self, file_sha1: Option<&str>) -> Result<UploadSummary, WorkerFailure> {
        self.transition(UploadState::Transferring);
        let item = self
            .ctx
            .client
            .upload_small(&self.remote_path, Bytes::new())
            .await
            .map_err(|e| self.failure(FailureStage::SimpleUpload, e))?;
        self.verify(&item, file_sha1)?;
        Ok(UploadSummary {
            item,
            bytes: 0,
            resumed_from: 0,
            session_restarts: 0,
        })
    }

    /// 建立上传会话
    ///
    /// # 参数
    /// * `try_resume` - 是否尝试使用已保存的会话
    async fn establish_session(
        &mut self,
        size: u64,
        file_sha1: Option<&str>,
        try_resume: bool,
    ) -> Result<UploadSession, WorkerFailure> {
        if try_resume {
            if let Some(session) = self.resume_saved(size, file_sha1).await {
                self.transition(UploadState::SessionEstablished);
                return Ok(session);
            }
        }

        let info = self
            .ctx
            .client
            .create_upload_session(&self.remote_path)
            .await
            .map_err(|e| self.failure(FailureStage::SessionCreation, e))?;
        let session = UploadSession::new(&info, size)
            .map_err(|e| self.failure(FailureStage::SessionCreation, e))?;

        if let (true, Some(store), Some(sha1)) = (
            self.ctx.config.resume_sessions,
            self.ctx.sessions.as_ref(),
            file_sha1,
        ) {
            let saved = SavedSession {
                upload_url: info.upload_url.clone(),
                expires: info.expiration_date_time,
            };
            if let Err(e) = store.save(&self.remote_path, sha1, &saved) {
                warn!("[{}] 保存上传会话失败: {}", self.remote_path, e);
            }
        }

        self.transition(UploadState::SessionEstablished);
        Ok(session)
    }

    /// 续传已保存的会话，以服务端报告的位置为准
    async fn resume_saved(&self, size: u64, file_sha1: Option<&str>) -> Option<UploadSession> {
        if !self.ctx.config.resume_sessions {
            return None;
        }
        let store = self.ctx.sessions.as_ref()?;
        // 没有文件摘要时无法确认本地文件未被修改
        let sha1 = file_sha1?;
        let saved = store.load(&self.remote_path, sha1)?;

        let resumed = match self.ctx.client.query_upload_session(&saved.upload_url).await {
            Ok(status) => confirmed_from_ranges(&status.next_expected_ranges, size).and_then(
                |confirmed| {
                    UploadSession::resumed(
                        saved.upload_url.clone(),
                        size,
                        confirmed.unwrap_or(size),
                        status.expiration_date_time.or(saved.expires),
                    )
                },
            ),
            Err(e) => Err(e),
        };

        match resumed {
            Ok(session) => {
                info!(
                    "[{}] 续传已保存的会话，从 {} 处继续",
                    self.remote_path,
                    format_bytes(session.confirmed_bytes())
                );
                Some(session)
            }
            Err(e) => {
                warn!("[{}] 已保存的会话不可用，重新创建: {}", self.remote_path, e);
                self.discard_saved(Some(sha1));
                None
            }
        }
    }

    fn discard_saved(&self, file_sha1: Option<&str>) {
        if let (Some(store), Some(sha1)) = (self.ctx.sessions.as_ref(), file_sha1) {
            if let Err(e) = store.discard(&self.remote_path, sha1) {
                warn!("[{}] 删除已保存的会话失败: {}", self.remote_path, e);
            }
        }
    }

    /// 逐个发送分片直到完成
    async fn transfer_segments(
        &mut self,
        session: &mut UploadSession,
        plan: &SegmentPlan,
        source: &dyn SegmentSource,
    ) -> Result<DriveItem, WorkerFailure> {
        self.transition(UploadState::Transferring);
        let count = plan.segment_count();
        let timeout = self.ctx.segment_timeout();
        let max_retries = self.ctx.config.max_retries_per_segment;

        loop {
            let Some(segment) = session.next_segment(plan) else {
                // 服务端已收齐但未返回网盘项（续传时最后一个响应丢失）
                return self.fetch_completed_item(count).await;
            };
            let stage = FailureStage::Segment {
                index: segment.index + 1,
                count,
            };
            let mut retries = 0u32;

            loop {
                if self.ctx.cancel.is_cancelled() {
                    info!("[{}] 上传已中断，会话保留以便续传", self.remote_path);
                    return Err(self.failure(stage, DriveError::Cancelled));
                }

                *self.segment_attempts.entry(segment.index).or_default() += 1;
                let outcome =
                    send_segment(&self.ctx.client, session, &segment, source, timeout).await;

                let reason = match outcome {
                    TransferOutcome::Completed(item) => {
                        session.mark_complete();
                        self.report_progress(session);
                        return Ok(*item);
                    }
                    TransferOutcome::Advanced(next) if next > session.confirmed_bytes() => {
                        session
                            .advance(next)
                            .map_err(|e| self.failure(stage, e))?;
                        debug!(
                            "[分片#{}] ✓ 已确认 {}/{}",
                            segment.index,
                            session.confirmed_bytes(),
                            session.expected_total_bytes()
                        );
                        self.report_progress(session);
                        break;
                    }
                    TransferOutcome::Advanced(next) if next < session.confirmed_bytes() => {
                        return Err(self.failure(
                            stage,
                            DriveError::Protocol(format!(
                                "服务端进度倒退: 已确认 {}，服务端报告 {}",
                                session.confirmed_bytes(),
                                next
                            )),
                        ));
                    }
                    // 服务端位置没有前进，视为未被接收
                    TransferOutcome::Advanced(next) => RetryReason::NotAccepted { expected: next },
                    TransferOutcome::Retryable(reason) => reason,
                    TransferOutcome::Fatal(e) => return Err(self.failure(stage, e)),
                };

                if retries >= max_retries {
                    error!(
                        "[分片#{}] 上传失败，已达最大重试次数 ({}): {}",
                        segment.index, max_retries, reason
                    );
                    return Err(self.failure(
                        stage,
                        DriveError::RetriesExhausted {
                            attempts: retries + 1,
                            last: reason.to_string(),
                        },
                    ));
                }

                let delay = with_jitter(calculate_backoff_delay(
                    retries,
                    self.ctx.config.retry_backoff_initial,
                    self.ctx.config.retry_backoff_max,
                    reason.retry_after(),
                ));
                retries += 1;
                warn!(
                    "[分片#{}] 上传失败，等待 {:?} 后重试 ({}/{}): {}",
                    segment.index, delay, retries, max_retries, reason
                );

                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => {
                        info!("[{}] 等待重试时被中断", self.remote_path);
                        return Err(self.failure(stage, DriveError::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn fetch_completed_item(&self, count: usize) -> Result<DriveItem, WorkerFailure> {
        let stage = FailureStage::Segment {
            index: count,
            count,
        };
        match self.ctx.client.metadata(&self.remote_path).await {
            Ok(item) => Ok(item),
            Err(DriveError::NotFound(_)) => Err(self.failure(
                stage,
                DriveError::Protocol("服务端已接收全部数据，但文件不存在".to_string()),
            )),
            Err(e) => Err(self.failure(stage, e)),
        }
    }

    fn report_progress(&self, session: &UploadSession) {
        self.ctx.emit(ProgressEvent::Progress {
            remote_path: self.remote_path.clone(),
            confirmed: session.confirmed_bytes(),
            total: session.expected_total_bytes(),
        });
    }

    /// 比较本地与服务端的 SHA-1
    fn verify(&self, item: &DriveItem, file_sha1: Option<&str>) -> Result<(), WorkerFailure> {
        let Some(local) = file_sha1 else {
            return Ok(());
        };
        match item.sha1() {
            Some(remote) if remote != local.to_ascii_lowercase() => Err(self.failure(
                FailureStage::Verification,
                DriveError::HashMismatch {
                    local: local.to_string(),
                    remote,
                },
            )),
            Some(_) => Ok(()),
            None => {
                warn!("[{}] 服务端未返回 SHA-1，跳过校验", self.remote_path);
                Ok(())
            }
        }
    }
}

/// 上传单个文件的便捷函数
pub async fn upload_file(
    ctx: WorkerContext,
    local_path: &Path,
    remote_path: &str,
) -> Result<UploadSummary, WorkerFailure> {
    UploadWorker::new(ctx, local_path, remote_path).run().await
}
