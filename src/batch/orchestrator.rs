// 批量任务调度
//
// 固定大小的工作者池：
// - Semaphore 控制同时运行的工作者数，排队的任务按提交顺序获取名额
// - 每个任务项独立运行，一项失败不影响其他项
// - 取消后停止派发，未开始的任务项标记为失败；运行中的任务在分片边界停止
// - 规划阶段已失败的任务项直接计入结果，不占用名额

use crate::batch::item::{BatchItem, ItemStatus, Transfer};
use crate::config::WorkerPoolConfig;
use crate::downloader::DownloadWorker;
use crate::drive::DriveClient;
use crate::uploader::{ProgressEvent, SavedSessionStore, UploadWorker, WorkerContext};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 未开始即被取消的任务项的失败原因
pub const INTERRUPTED_BEFORE_START: &str = "interrupted before start";

/// 批量执行结果
#[derive(Debug)]
pub struct BatchReport {
    pub items: Vec<Arc<BatchItem>>,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<(Arc<BatchItem>, String)>,
    /// 观察到的最大同时运行工作者数
    pub peak_concurrency: usize,
}

impl BatchReport {
    fn from_items(items: Vec<Arc<BatchItem>>, peak_concurrency: usize) -> Self {
        let mut succeeded = 0;
        let mut failures = Vec::new();
        for item in &items {
            match item.status() {
                ItemStatus::Succeeded => succeeded += 1,
                ItemStatus::Failed(reason) => failures.push((item.clone(), reason)),
                // 调用方保证此时全部为终态
                ItemStatus::Pending | ItemStatus::InProgress => {}
            }
        }
        Self {
            succeeded,
            failed: failures.len(),
            failures,
            items,
            peak_concurrency,
        }
    }

    /// 进程退出码: 全部成功为 0，否则为 1
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }
}

/// 批量任务调度器
pub struct BatchOrchestrator {
    client: Arc<DriveClient>,
    config: Arc<WorkerPoolConfig>,
    sessions: Option<Arc<SavedSessionStore>>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl BatchOrchestrator {
    pub fn new(client: Arc<DriveClient>, config: Arc<WorkerPoolConfig>) -> Self {
        Self {
            client,
            config,
            sessions: None,
            progress: None,
        }
    }

    pub fn with_sessions(mut self, store: Arc<SavedSessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// 执行全部任务项，所有项进入终态后返回
    pub async fn run(&self, items: Vec<BatchItem>, cancel: CancellationToken) -> BatchReport {
        let items: Vec<Arc<BatchItem>> = items.into_iter().map(Arc::new).collect();
        let runnable = items.iter().filter(|i| !i.status().is_terminal()).count();
        let concurrency = self.config.effective_concurrency(runnable);
        info!(
            "开始批量任务: {} 项（{} 项规划时已失败）, 并发 {}",
            items.len(),
            items.len() - runnable,
            concurrency
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();

        let mut ctx = WorkerContext::new(self.client.clone(), self.config.clone())
            .with_cancel(cancel.clone())
            .with_concurrency(concurrency);
        if let Some(store) = &self.sessions {
            ctx = ctx.with_sessions(store.clone());
        }
        if let Some(progress) = &self.progress {
            ctx = ctx.with_progress(progress.clone());
        }

        for item in &items {
            if item.status().is_terminal() {
                debug!("跳过已失败的任务项: {}", item);
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            item.start();
            let item = item.clone();
            let ctx = ctx.clone();
            let active = active.clone();
            let peak = peak.clone();

            join_set.spawn(async move {
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                debug!("工作者启动: {} (运行中 {})", item, running);

                let result = run_item(ctx, item.transfer()).await;
                if let Err(reason) = &result {
                    warn!("任务项失败: {}", reason);
                }
                item.finish(result);

                active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                error!("工作者异常退出: {}", e);
            }
        }

        for item in &items {
            match item.status() {
                ItemStatus::Pending => {
                    item.finish(Err(INTERRUPTED_BEFORE_START.to_string()));
                }
                ItemStatus::InProgress => {
                    item.finish(Err("工作者异常退出".to_string()));
                }
                _ => {}
            }
        }

        let report = BatchReport::from_items(items, peak.load(Ordering::SeqCst));
        info!(
            "批量任务结束: 成功 {}, 失败 {}, 最大并发 {}",
            report.succeeded, report.failed, report.peak_concurrency
        );
        report
    }
}

async fn run_item(ctx: WorkerContext, transfer: &Transfer) -> Result<(), String> {
    match transfer {
        Transfer::Upload { local, remote } => UploadWorker::new(ctx, local, remote)
            .run()
            .await
            .map(|_| ())
            .map_err(|failure| failure.to_string()),
        Transfer::Download { remote, local } => DownloadWorker::new(ctx, remote, local)
            .run()
            .await
            .map(|_| ())
            .map_err(|failure| failure.to_string()),
    }
}
