// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

/// 默认 API 入口（Microsoft Graph，个人网盘）
pub const DEFAULT_API_ENDPOINT: &str = "https://graph.microsoft.com/v1.0/me";

/// 访问令牌环境变量
pub const ACCESS_TOKEN_ENV: &str = "ONEDRIVE_ACCESS_TOKEN";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// API 配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 入口地址
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// 访问令牌（环境变量 ONEDRIVE_ACCESS_TOKEN 优先）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// 普通 API 请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_endpoint() -> String {
    DEFAULT_API_ENDPOINT.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_upload_concurrency")]
    pub max_concurrent_tasks: usize,
    /// 分片大小 (MB)
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    /// 单个分片的基础超时（秒），每个并发任务再额外加 1 秒
    #[serde(default = "default_base_segment_timeout_secs")]
    pub base_segment_timeout_secs: u64,
    /// 流式读取分片（省内存，但更慢、更容易卡住）
    #[serde(default)]
    pub streaming: bool,
    /// 单个分片最大重试次数
    #[serde(default = "default_upload_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_backoff_initial_ms")]
    pub retry_backoff_initial_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// 是否校验 SHA-1
    #[serde(default = "default_true")]
    pub compare_hash: bool,
    /// 是否保存并恢复上传会话
    #[serde(default = "default_true")]
    pub resume_sessions: bool,
    /// 会话失效后最多重新创建几次
    #[serde(default = "default_max_session_restarts")]
    pub max_session_restarts: u32,
}

fn default_upload_concurrency() -> usize {
    8
}

fn default_chunk_size_mb() -> u64 {
    10
}

fn default_base_segment_timeout_secs() -> u64 {
    15
}

fn default_upload_max_retries() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_session_restarts() -> u32 {
    1
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_upload_concurrency(),
            chunk_size_mb: default_chunk_size_mb(),
            base_segment_timeout_secs: default_base_segment_timeout_secs(),
            streaming: false,
            max_retries: default_upload_max_retries(),
            retry_backoff_initial_ms: default_backoff_initial_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
            compare_hash: true,
            resume_sessions: true,
            max_session_restarts: default_max_session_restarts(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 最大同时下载文件数（0 表示不限制）
    #[serde(default)]
    pub max_concurrent_tasks: usize,
    /// 下载超时（秒）
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
    /// 最大重试次数（续传 .part 文件）
    #[serde(default = "default_download_max_retries")]
    pub max_retries: u32,
    /// 是否校验 SHA-1
    #[serde(default = "default_true")]
    pub compare_hash: bool,
}

fn default_download_timeout_secs() -> u64 {
    300
}

fn default_download_max_retries() -> u32 {
    3
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 0,
            timeout_secs: default_download_timeout_secs(),
            max_retries: default_download_max_retries(),
            compare_hash: true,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 数据目录：$XDG_DATA_HOME/onedrive 或 ~/.local/share/onedrive
pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// 配置目录：$XDG_CONFIG_HOME/onedrive 或 ~/.config/onedrive
pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

fn xdg_dir(env_key: &str, home_fallback: &str) -> PathBuf {
    match std::env::var_os(env_key) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("onedrive"),
        _ => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(home_fallback)
            .join("onedrive"),
    }
}

impl AppConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;

        Ok(config)
    }

    /// 加载配置，文件不存在时使用默认配置
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load_from_file(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// 保存配置到文件（先写临时文件再原子重命名）
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        let temp_path = path.with_extension("toml.tmp");
        fs::write(&temp_path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", temp_path))?;
        fs::rename(&temp_path, path)
            .await
            .with_context(|| format!("保存配置文件失败: {:?}", path))?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 访问令牌（环境变量优先）
    pub fn access_token(&self) -> Option<String> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.api.access_token.clone())
    }
}

/// 配置校验错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("并发任务数必须至少为 1")]
    ZeroWorkers,
    #[error("分片大小必须大于 0")]
    ZeroChunkSize,
    #[error("分片大小 {0} 超过单次请求上限 {1}")]
    ChunkTooLarge(u64, u64),
    #[error("分片超时必须大于 0")]
    ZeroTimeout,
}

/// 单个分片请求的大小上限: 60MB（服务端限制）
pub const MAX_SEGMENT_SIZE: u64 = 60 * 1024 * 1024;

/// 分片对齐单位: 320KB（服务端建议分片大小为其整数倍）
pub const SEGMENT_ALIGNMENT: u64 = 320 * 1024;

/// 批处理工作池配置
///
/// 一次批处理运行期间不可变，由各组件在构造时持有
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// 最大并发工作者数
    pub max_concurrent_workers: usize,
    /// 分片大小（字节）
    pub chunk_size_bytes: u64,
    /// 单分片基础超时
    pub base_segment_timeout: Duration,
    /// 流式读取模式
    pub streaming_mode: bool,
    /// 单分片最大重试次数
    pub max_retries_per_segment: u32,
    /// 初始退避延迟
    pub retry_backoff_initial: Duration,
    /// 最大退避延迟
    pub retry_backoff_max: Duration,
    /// 是否校验 SHA-1
    pub compare_hash: bool,
    /// 是否保存并恢复上传会话
    pub resume_sessions: bool,
    /// 会话失效后最多重新创建几次
    pub max_session_restarts: u32,
    /// 下载请求超时
    pub download_timeout: Duration,
    /// 下载中断后的最大续传次数
    pub download_max_retries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_configs(&UploadConfig::default(), &DownloadConfig::default())
    }
}

impl WorkerPoolConfig {
    /// 由上传 / 下载配置合成
    pub fn from_configs(upload: &UploadConfig, download: &DownloadConfig) -> Self {
        Self {
            max_concurrent_workers: upload.max_concurrent_tasks,
            chunk_size_bytes: upload.chunk_size_mb * 1024 * 1024,
            base_segment_timeout: Duration::from_secs(upload.base_segment_timeout_secs),
            streaming_mode: upload.streaming,
            max_retries_per_segment: upload.max_retries,
            retry_backoff_initial: Duration::from_millis(upload.retry_backoff_initial_ms),
            retry_backoff_max: Duration::from_millis(upload.retry_backoff_max_ms),
            compare_hash: upload.compare_hash,
            resume_sessions: upload.resume_sessions,
            max_session_restarts: upload.max_session_restarts,
            download_timeout: Duration::from_secs(download.timeout_secs),
            download_max_retries: download.max_retries,
        }
    }

    /// 校验配置
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.chunk_size_bytes > MAX_SEGMENT_SIZE {
            return Err(ConfigError::ChunkTooLarge(
                self.chunk_size_bytes,
                MAX_SEGMENT_SIZE,
            ));
        }
        if self.base_segment_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.chunk_size_bytes % SEGMENT_ALIGNMENT != 0 {
            tracing::warn!(
                "分片大小 {} 不是 320KB 的整数倍，服务端可能拒绝部分分片",
                self.chunk_size_bytes
            );
        }
        Ok(self)
    }

    /// 单个分片的截止时间
    ///
    /// 基础超时 + 每个并发工作者 1 秒（多个工作者共享带宽）
    pub fn segment_timeout(&self, concurrent_workers: usize) -> Duration {
        self.base_segment_timeout + Duration::from_secs(concurrent_workers as u64)
    }

    /// 一批任务实际的并发数
    pub fn effective_concurrency(&self, batch_size: usize) -> usize {
        self.max_concurrent_workers.min(batch_size).max(1)
    }
}
