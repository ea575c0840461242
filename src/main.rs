use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use onedrive_rust::{
    batch::{BatchItem, BatchOrchestrator, BatchPlanner, BatchReport, TargetMode},
    config::{data_dir, AppConfig, WorkerPoolConfig},
    drive::{DriveClient, ListResult, ReqwestTransport, StaticTokenProvider, DEFAULT_COPY_POLL_INTERVAL},
    logging,
    uploader::{ProgressEvent, SavedSessionStore},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "onedrive", version)]
#[command(about = "OneDrive 命令行客户端（断点续传上传 / 批量下载）", long_about = None)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/onedrive/config.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传本地文件到网盘目录
    Upload {
        /// 网盘目标目录
        directory: String,
        /// 本地文件或目录
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// 上传目录
        #[arg(short, long)]
        recursive: bool,
        /// 单分片基础超时（秒），每个并发任务再加 1 秒
        #[arg(long)]
        base_segment_timeout: Option<u64>,
        /// 流式读取分片（省内存，但更容易卡住）
        #[arg(short, long)]
        streaming_upload: bool,
        /// 分片大小（MB）
        #[arg(long)]
        chunk_size_mb: Option<u64>,
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// 下载网盘文件
    Download {
        /// 网盘文件或目录
        #[arg(required = true)]
        paths: Vec<String>,
        /// 本地目标目录
        #[arg(short = 'd', long, default_value = ".")]
        dir: PathBuf,
        /// 下载目录
        #[arg(short, long)]
        recursive: bool,
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// 列出目录
    Ls {
        paths: Vec<String>,
        /// 显示大小和修改时间
        #[arg(short, long)]
        long: bool,
    },
    /// 输出元数据（JSON）
    Metadata {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// 创建目录
    Mkdir {
        #[arg(required = true)]
        paths: Vec<String>,
        /// 自动创建父目录，已存在时不报错
        #[arg(short, long)]
        parents: bool,
    },
    /// 删除文件或目录
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
        /// 删除目录
        #[arg(short = 'r', short_alias = 'R', long)]
        recursive: bool,
    },
    /// 删除空目录
    Rmdir {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// 移动 / 重命名
    Mv {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// 复制
    Cp {
        #[command(flatten)]
        target: TargetArgs,
        /// 复制目录
        #[arg(short = 'r', short_alias = 'R', long)]
        recursive: bool,
    },
}

#[derive(Args)]
struct BatchArgs {
    /// 并发任务数，0 表示不限制
    #[arg(short, long)]
    jobs: Option<usize>,
    /// 不校验 SHA-1
    #[arg(long)]
    no_check: bool,
}

#[derive(Args)]
struct TargetArgs {
    /// SOURCE DEST | SOURCE... DIRECTORY | -t DIRECTORY SOURCE...
    #[arg(required = true, num_args = 2..)]
    paths: Vec<String>,
    /// 第一个路径是目标目录
    #[arg(short = 't', long, conflicts_with = "no_target_directory")]
    target_directory: bool,
    /// 目标是完整路径而不是目录
    #[arg(short = 'T', long)]
    no_target_directory: bool,
    /// 覆盖已存在的目标
    #[arg(short, long)]
    force: bool,
}

impl TargetArgs {
    fn mode(&self) -> TargetMode {
        if self.target_directory {
            TargetMode::TargetDirectory
        } else if self.no_target_directory {
            TargetMode::NoTargetDirectory
        } else {
            TargetMode::Auto
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::load_or_default(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败: {:#}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init_logging(&config.log, cli.verbose);
    info!("OneDrive Rust v{} 启动", env!("CARGO_PKG_VERSION"));

    let code = match run(cli.cmd, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    drop(_log_guard);
    std::process::exit(code);
}

fn build_client(config: &AppConfig) -> Result<Arc<DriveClient>> {
    let tokens = match config.access_token() {
        Some(token) => StaticTokenProvider::new(token),
        None => StaticTokenProvider::missing(),
    };
    let transport = ReqwestTransport::new(Duration::from_secs(config.api.connect_timeout_secs))
        .context("创建 HTTP 客户端失败")?;
    let client = DriveClient::new(Arc::new(transport), Arc::new(tokens), config.api.endpoint.clone())
        .with_request_timeout(Duration::from_secs(config.api.request_timeout_secs));
    Ok(Arc::new(client))
}

/// Ctrl-C 时取消：停止派发新任务，运行中的任务在分片边界停下
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，停止派发新任务（已创建的上传会话保留，可稍后续传）");
            token.cancel();
        }
    });
    cancel
}

/// 单个任务时在终端显示进度
fn progress_printer() -> mpsc::UnboundedSender<ProgressEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Progress {
                remote_path,
                confirmed,
                total,
            } = event
            {
                let percent = if total == 0 { 100 } else { confirmed * 100 / total };
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    eprint!("\r{}: {}%", remote_path, percent);
                    if percent == 100 {
                        eprintln!();
                    }
                }
            }
        }
    });
    tx
}

fn pool_config(
    config: &AppConfig,
    jobs: Option<usize>,
    default_jobs: usize,
    item_count: usize,
) -> Result<WorkerPoolConfig> {
    let mut pool = WorkerPoolConfig::from_configs(&config.upload, &config.download);
    let jobs = jobs.unwrap_or(default_jobs);
    pool.max_concurrent_workers = if jobs == 0 { item_count.max(1) } else { jobs };
    pool.validate().context("配置无效")
}

async fn run_batch(
    client: Arc<DriveClient>,
    pool: WorkerPoolConfig,
    items: Vec<BatchItem>,
) -> BatchReport {
    let single = items.len() == 1;
    let mut orchestrator = BatchOrchestrator::new(client, Arc::new(pool.clone()));
    if pool.resume_sessions {
        orchestrator =
            orchestrator.with_sessions(Arc::new(SavedSessionStore::new(data_dir().join("saved_sessions"))));
    }
    if single {
        orchestrator = orchestrator.with_progress(progress_printer());
    }

    let report = orchestrator.run(items, cancel_on_ctrl_c()).await;
    for (item, reason) in &report.failures {
        eprintln!("失败: {}: {}", item, reason);
    }
    report
}

async fn run(cmd: Command, config: &AppConfig) -> Result<i32> {
    let client = build_client(config)?;

    match cmd {
        Command::Upload {
            directory,
            paths,
            recursive,
            base_segment_timeout,
            streaming_upload,
            chunk_size_mb,
            batch,
        } => {
            let mut config = config.clone();
            if let Some(secs) = base_segment_timeout {
                config.upload.base_segment_timeout_secs = secs;
            }
            if let Some(mb) = chunk_size_mb {
                config.upload.chunk_size_mb = mb;
            }
            config.upload.streaming |= streaming_upload;
            if batch.no_check {
                config.upload.compare_hash = false;
            }

            let items = BatchPlanner::new(client.clone())
                .plan_upload(&directory, &paths, recursive)
                .await?;
            let default_jobs = config.upload.max_concurrent_tasks;
            let pool = pool_config(&config, batch.jobs, default_jobs, items.len())?;
            Ok(run_batch(client, pool, items).await.exit_code())
        }

        Command::Download {
            paths,
            dir,
            recursive,
            batch,
        } => {
            let mut config = config.clone();
            if batch.no_check {
                config.upload.compare_hash = false;
                config.download.compare_hash = false;
            }
            let items = BatchPlanner::new(client.clone())
                .plan_download(&paths, &dir, recursive)
                .await?;
            let default_jobs = config.download.max_concurrent_tasks;
            let mut pool = pool_config(&config, batch.jobs, default_jobs, items.len())?;
            pool.compare_hash = config.download.compare_hash;
            Ok(run_batch(client, pool, items).await.exit_code())
        }

        Command::Ls { paths, long } => {
            let paths = if paths.is_empty() { vec![String::new()] } else { paths };
            let mut code = 0;
            for path in &paths {
                match client.list(path).await {
                    Ok(ListResult::File(item)) => print_entry(&item, long),
                    Ok(ListResult::Directory(children)) => {
                        if paths.len() > 1 {
                            println!("{}:", if path.is_empty() { "/" } else { path });
                        }
                        for item in &children {
                            print_entry(item, long);
                        }
                    }
                    Err(e) => {
                        error!("列出 '{}' 失败: {}", path, e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }

        Command::Metadata { paths } => {
            let mut code = 0;
            for path in &paths {
                match client.metadata(path).await {
                    Ok(item) => println!("{}", serde_json::to_string_pretty(&item)?),
                    Err(e) => {
                        error!("获取 '{}' 元数据失败: {}", path, e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }

        Command::Mkdir { paths, parents } => {
            let mut code = 0;
            for path in &paths {
                let result = if parents {
                    client.makedirs(path, true).await
                } else {
                    client.mkdir(path).await
                };
                match result {
                    Ok(item) => info!("已创建目录 '{}' ({})", path, item.web_url.unwrap_or_default()),
                    Err(e) => {
                        error!("创建目录 '{}' 失败: {}", path, e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }

        Command::Rm { paths, recursive } => {
            let mut code = 0;
            for path in &paths {
                if let Err(e) = client.remove(path, recursive).await {
                    error!("删除 '{}' 失败: {}", path, e);
                    code = 1;
                }
            }
            Ok(code)
        }

        Command::Rmdir { paths } => {
            let mut code = 0;
            for path in &paths {
                if let Err(e) = client.rmdir(path).await {
                    error!("删除目录 '{}' 失败: {}", path, e);
                    code = 1;
                }
            }
            Ok(code)
        }

        Command::Mv { target } => {
            let pairs = BatchPlanner::new(client.clone())
                .plan_relocation(&target.paths, target.mode())
                .await?;
            let mut code = 0;
            for (src, dst) in pairs {
                match client.move_item(&src, &dst, target.force).await {
                    Ok(_) => info!("已移动 '{}' -> '{}'", src, dst),
                    Err(e) => {
                        error!("移动 '{}' 到 '{}' 失败: {}", src, dst, e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }

        Command::Cp { target, recursive } => {
            let pairs = BatchPlanner::new(client.clone())
                .plan_relocation(&target.paths, target.mode())
                .await?;

            // 复制由服务端异步执行，各项同时提交并等待
            let mut join_set = JoinSet::new();
            for (src, dst) in pairs {
                let client = client.clone();
                let force = target.force;
                join_set.spawn(async move {
                    if !recursive && client.is_dir(&src).await? {
                        let err = onedrive_rust::DriveError::IsADirectory(src.clone());
                        return Err(anyhow::Error::new(err).context("复制目录需要 -r"));
                    }
                    client
                        .copy(&src, &dst, force, DEFAULT_COPY_POLL_INTERVAL)
                        .await
                        .with_context(|| format!("复制 '{}' 到 '{}' 失败", src, dst))?;
                    info!("已复制 '{}' -> '{}'", src, dst);
                    Ok::<_, anyhow::Error>(())
                });
            }

            let mut code = 0;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("{:#}", e);
                        code = 1;
                    }
                    Err(e) => {
                        error!("复制任务异常退出: {}", e);
                        code = 1;
                    }
                }
            }
            Ok(code)
        }
    }
}

fn print_entry(item: &onedrive_rust::DriveItem, long: bool) {
    let name = if item.is_dir() {
        format!("{}/", item.name)
    } else {
        item.name.clone()
    };
    if long {
        let modified = item
            .last_modified_date_time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{:>12} {:16} {}", item.size, modified, name);
    } else {
        println!("{}", name);
    }
}
