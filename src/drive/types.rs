// OneDrive API 数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 网盘项（文件或目录）元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ItemReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileFacet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<FolderFacet>,
    /// 预签名下载地址（短时有效，无需令牌）
    #[serde(
        default,
        rename = "@microsoft.graph.downloadUrl",
        alias = "@content.downloadUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub download_url: Option<String>,
}

impl DriveItem {
    pub fn is_dir(&self) -> bool {
        self.folder.is_some()
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some()
    }

    /// 服务端记录的 SHA-1（小写）
    pub fn sha1(&self) -> Option<String> {
        self.file
            .as_ref()
            .and_then(|f| f.hashes.as_ref())
            .and_then(|h| h.sha1_hash.as_deref())
            .map(|h| h.to_ascii_lowercase())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

/// 创建上传会话的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionInfo {
    pub upload_url: String,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

/// 上传会话状态（分片响应 202 或 GET uploadUrl）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionStatus {
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// 目录列表分页
#[derive(Debug, Clone, Deserialize)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// 错误响应 `{ "error": { code, message, innererror } }`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub innererror: Option<Box<ApiError>>,
}

impl ApiError {
    /// 最内层的错误码（fragmentRowCountCheckFailed 等细分错误在 innererror 中）
    pub fn codes(&self) -> Vec<&str> {
        let mut codes = vec![self.code.as_str()];
        let mut inner = self.innererror.as_deref();
        while let Some(err) = inner {
            codes.push(err.code.as_str());
            inner = err.innererror.as_deref();
        }
        codes
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.codes().iter().any(|c| *c == code)
    }
}

/// 复制任务状态（monitor URL 返回）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub percentage_complete: Option<f64>,
    #[serde(default)]
    pub resource_id: Option<String>,
}

/// `ls` 结果类型
#[derive(Debug, Clone)]
pub enum ListResult {
    /// 路径是文件，返回自身元数据
    File(DriveItem),
    /// 路径是目录，返回子项
    Directory(Vec<DriveItem>),
}

/// 解析 nextExpectedRanges 中的起始偏移（"26-" 或 "26-99"）
pub fn parse_range_start(range: &str) -> Option<u64> {
    range.split('-').next()?.trim().parse().ok()
}
