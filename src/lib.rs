// OneDrive Rust Library
// OneDrive 客户端核心库：断点续传分片上传 + 并发批量调度

// 公共模块（路径、哈希）
pub mod common;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志模块
pub mod logging;

// 网盘 API 模块
pub mod drive;

// 上传引擎模块
pub mod uploader;

// 下载引擎模块
pub mod downloader;

// 批量任务模块
pub mod batch;

// 导出常用类型
pub use batch::{BatchItem, BatchOrchestrator, BatchPlanner, BatchReport};
pub use config::{AppConfig, WorkerPoolConfig};
pub use downloader::DownloadWorker;
pub use drive::{DriveClient, DriveItem, ReqwestTransport, StaticTokenProvider};
pub use error::{DriveError, DriveResult, TransportError};
pub use uploader::{UploadState, UploadWorker, WorkerContext};
