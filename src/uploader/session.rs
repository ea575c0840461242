//! 上传会话
//!
//! - [`UploadSession`]: 服务端上传会话的本地视图，跟踪服务端已确认的字节数
//! - [`SavedSessionStore`]: 会话持久化，中断后可从服务端记录的位置续传
//!
//! ## 保存格式
//!
//! `{data_dir}/saved_sessions/{sha1(远程路径 + "\n" + 文件 SHA-1)}.json`：
//! ```json
//! { "upload_url": "https://...", "expires": "2026-01-01T00:00:00Z" }
//! ```

use crate::common::sha1_hex;
use crate::drive::{parse_range_start, UploadSessionInfo};
use crate::error::{DriveError, DriveResult};
use crate::uploader::chunk::{Segment, SegmentPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 上传会话
///
/// 不变量：confirmed_bytes 只增不减，且不超过 expected_total_bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    upload_url: String,
    expected_total_bytes: u64,
    confirmed_bytes: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// 由创建会话的响应构造
    pub fn new(info: &UploadSessionInfo, total: u64) -> DriveResult<Self> {
        let confirmed = confirmed_from_ranges(&info.next_expected_ranges, total)?.unwrap_or(0);
        Self::resumed(
            info.upload_url.clone(),
            total,
            confirmed,
            info.expiration_date_time,
        )
    }

    /// 由已保存的会话和服务端状态构造
    pub fn resumed(
        upload_url: String,
        total: u64,
        confirmed: u64,
        expires_at: Option<DateTime<Utc>>,
    ) -> DriveResult<Self> {
        if confirmed > total {
            return Err(DriveError::Protocol(format!(
                "服务端确认 {} 字节，超过文件大小 {}",
                confirmed, total
            )));
        }
        Ok(Self {
            upload_url,
            expected_total_bytes: total,
            confirmed_bytes: confirmed,
            expires_at,
        })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }

    pub fn expected_total_bytes(&self) -> u64 {
        self.expected_total_bytes
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed_bytes
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_complete(&self) -> bool {
        self.confirmed_bytes == self.expected_total_bytes
    }

    /// 更新服务端确认的字节数
    pub fn advance(&mut self, new_confirmed: u64) -> DriveResult<()> {
        if new_confirmed < self.confirmed_bytes {
            return Err(DriveError::Protocol(format!(
                "服务端确认字节数回退: {} -> {}",
                self.confirmed_bytes, new_confirmed
            )));
        }
        if new_confirmed > self.expected_total_bytes {
            return Err(DriveError::Protocol(format!(
                "服务端确认 {} 字节，超过文件大小 {}",
                new_confirmed, self.expected_total_bytes
            )));
        }
        self.confirmed_bytes = new_confirmed;
        Ok(())
    }

    /// 服务端已返回完成的网盘项
    pub fn mark_complete(&mut self) {
        self.confirmed_bytes = self.expected_total_bytes;
    }

    pub fn set_expires_at(&mut self, expires_at: Option<DateTime<Utc>>) {
        if expires_at.is_some() {
            self.expires_at = expires_at;
        }
    }

    /// 下一个要发送的分片
    pub fn next_segment(&self, plan: &SegmentPlan) -> Option<Segment> {
        plan.segment_at(self.confirmed_bytes)
    }
}

/// 由 nextExpectedRanges 计算服务端已确认的字节数
///
/// # 返回
/// - `Some(offset)` - 服务端期望的下一个字节
/// - `None` - 列表为空（服务端已收齐）
pub fn confirmed_from_ranges(ranges: &[String], total: u64) -> DriveResult<Option<u64>> {
    match ranges {
        [] => Ok(None),
        [range] => {
            let start = parse_range_start(range).ok_or_else(|| {
                DriveError::Protocol(format!("无法解析 nextExpectedRanges: '{}'", range))
            })?;
            if start > total {
                return Err(DriveError::Protocol(format!(
                    "nextExpectedRanges 起点 {} 超过文件大小 {}",
                    start, total
                )));
            }
            Ok(Some(start))
        }
        _ => Err(DriveError::Protocol(format!(
            "不支持多段续传: {:?}",
            ranges
        ))),
    }
}

/// 已保存的上传会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSession {
    pub upload_url: String,
    pub expires: Option<DateTime<Utc>>,
}

impl SavedSession {
    pub fn is_expired(&self) -> bool {
        matches!(self.expires, Some(expires) if expires <= Utc::now())
    }
}

/// 上传会话持久化
#[derive(Debug, Clone)]
pub struct SavedSessionStore {
    dir: PathBuf,
}

impl SavedSessionStore {
    /// # 参数
    /// * `dir` - 保存目录（通常为 `{data_dir}/saved_sessions`）
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 会话文件路径
    ///
    /// 文件摘要参与命名：本地文件被修改后不会误用旧会话
    pub fn session_path(&self, remote_path: &str, file_sha1: &str) -> PathBuf {
        let id = sha1_hex(format!("{}\n{}", remote_path, file_sha1).as_bytes());
        self.dir.join(format!("{}.json", id))
    }

    /// 加载会话，已过期的会话会被删除
    pub fn load(&self, remote_path: &str, file_sha1: &str) -> Option<SavedSession> {
        let path = self.session_path(remote_path, file_sha1);
        if !path.exists() {
            return None;
        }

        let session = match Self::load_from_path(&path) {
            Ok(session) => session,
            Err(e) => {
                warn!("加载已保存的上传会话失败 {:?}: {}", path, e);
                return None;
            }
        };

        if session.is_expired() {
            debug!("已保存的上传会话已过期: {:?}", path);
            if let Err(e) = fs::remove_file(&path) {
                warn!("删除过期会话失败 {:?}: {}", path, e);
            }
            return None;
        }

        Some(session)
    }

    fn load_from_path(path: &Path) -> io::Result<SavedSession> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// 保存会话（先写临时文件再原子重命名）
    pub fn save(
        &self,
        remote_path: &str,
        file_sha1: &str,
        session: &SavedSession,
    ) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.session_path(remote_path, file_sha1);
        let temp_path = path.with_extension("json.tmp");

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, session)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        debug!("已保存上传会话: {:?} ({})", path, remote_path);
        Ok(())
    }

    /// 删除会话
    ///
    /// # 返回
    /// - `Ok(true)` - 已删除
    /// - `Ok(false)` - 不存在
    pub fn discard(&self, remote_path: &str, file_sha1: &str) -> io::Result<bool> {
        let path = self.session_path(remote_path, file_sha1);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("已删除上传会话: {:?}", path);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
