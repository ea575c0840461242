//! 批量任务规划
//!
//! 把目录树操作展开成扁平的 [`BatchItem`] 列表，交给同一个调度器执行：
//! - 上传：扫描本地目录，预先在网盘创建所需目录，每个文件一项
//! - 下载：遍历网盘目录，预先在本地创建目录，每个文件一项
//! - 移动 / 复制：按 coreutils 的 `-t` / `-T` 规则计算目标路径
//!
//! 单个路径的问题（不存在、目录未加 `-r`）生成已失败的任务项，不影响其他路径；
//! 目标目录不可用时整个规划失败

use crate::batch::item::{BatchItem, Transfer};
use crate::common::{format_bytes, join_remote, local_to_remote, normalize_remote_path, remote_basename};
use crate::drive::{DriveClient, DriveItem};
use crate::error::DriveError;
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 本地扫描到的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub local_path: PathBuf,
    /// 相对于扫描根目录的路径
    pub relative_path: PathBuf,
    pub size: u64,
}

/// 本地目录扫描结果
#[derive(Debug, Default)]
pub struct LocalTree {
    /// 全部子目录（相对路径，父目录在前）
    pub dirs: Vec<PathBuf>,
    /// 全部文件（按相对路径排序）
    pub files: Vec<ScannedFile>,
}

/// 扫描选项
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub follow_symlinks: bool,
    /// 跳过以 `.` 开头的文件和目录
    pub skip_hidden: bool,
}

/// 递归扫描本地目录
pub fn scan_local(root: &Path, options: &ScanOptions) -> Result<LocalTree> {
    if !root.is_dir() {
        bail!("扫描路径不是文件夹: {}", root.display());
    }

    let skip_hidden = options.skip_hidden;
    let walker = WalkDir::new(root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0
                || !skip_hidden
                || !entry.file_name().to_string_lossy().starts_with('.')
        });

    let mut tree = LocalTree::default();
    for entry in walker {
        let entry = entry.with_context(|| format!("扫描目录失败: {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("计算相对路径失败: {}", entry.path().display()))?
            .to_path_buf();

        if entry.file_type().is_dir() {
            tree.dirs.push(relative);
        } else if entry.file_type().is_file() {
            let size = entry
                .metadata()
                .with_context(|| format!("读取文件元数据失败: {}", entry.path().display()))?
                .len();
            tree.files.push(ScannedFile {
                local_path: entry.into_path(),
                relative_path: relative,
                size,
            });
        } else {
            debug!("跳过非常规文件: {}", entry.path().display());
        }
    }

    tree.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    info!(
        "扫描完成 {}: {} 个目录, {} 个文件, 共 {}",
        root.display(),
        tree.dirs.len(),
        tree.files.len(),
        format_bytes(tree.files.iter().map(|f| f.size).sum())
    );
    Ok(tree)
}

/// 本地路径的文件名
fn local_basename(path: &Path) -> Result<String> {
    // `dir/.` 之类的路径先规范化
    let resolved;
    let path = if path.file_name().is_none() {
        resolved = path
            .canonicalize()
            .with_context(|| format!("无法解析路径: {}", path.display()))?;
        resolved.as_path()
    } else {
        path
    };
    match path.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("无法确定文件名: {}", path.display()),
    }
}

/// 移动 / 复制的目标解析方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// 两个参数时按目标是否为已有目录决定
    #[default]
    Auto,
    /// `-t`: 第一个参数是目标目录
    TargetDirectory,
    /// `-T`: 目标是完整路径
    NoTargetDirectory,
}

/// 批量任务规划器
pub struct BatchPlanner {
    client: Arc<DriveClient>,
    options: ScanOptions,
}

impl BatchPlanner {
    pub fn new(client: Arc<DriveClient>) -> Self {
        Self {
            client,
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// 规划上传
    ///
    /// # 参数
    /// * `remote_dir` - 网盘目标目录（必须已存在）
    /// * `local_paths` - 本地文件或目录
    /// * `recursive` - 是否允许上传目录
    ///
    /// 文件 `a/b.txt` 上传到 `{remote_dir}/b.txt`；目录 `a/d` 上传到 `{remote_dir}/d/...`
    pub async fn plan_upload(
        &self,
        remote_dir: &str,
        local_paths: &[PathBuf],
        recursive: bool,
    ) -> Result<Vec<BatchItem>> {
        let remote_dir = normalize_remote_path(remote_dir);
        let target = self.client.metadata(&remote_dir).await?;
        if !target.is_dir() {
            return Err(DriveError::NotADirectory(remote_dir).into());
        }

        let mut items = Vec::new();
        for local in local_paths {
            let name = local_basename(local).unwrap_or_else(|_| local.display().to_string());
            let remote = join_remote(&remote_dir, &name);
            let transfer = Transfer::Upload {
                local: local.clone(),
                remote: remote.clone(),
            };

            let meta = match tokio::fs::metadata(local).await {
                Ok(meta) => meta,
                Err(e) => {
                    items.push(rejected(transfer, DriveError::local_io(local, e).to_string()));
                    continue;
                }
            };
            if meta.is_file() {
                items.push(BatchItem::new(transfer));
                continue;
            }
            if !meta.is_dir() {
                warn!("跳过非常规文件: {}", local.display());
                continue;
            }
            if !recursive {
                let err = DriveError::IsADirectory(local.display().to_string());
                items.push(rejected(transfer, format!("{}，上传目录需要 -r", err)));
                continue;
            }

            let root = local.clone();
            let options = self.options.clone();
            let tree = match tokio::task::spawn_blocking(move || scan_local(&root, &options))
                .await
                .context("扫描任务异常退出")?
            {
                Ok(tree) => tree,
                Err(e) => {
                    items.push(rejected(transfer, format!("{:#}", e)));
                    continue;
                }
            };

            self.client.makedirs(&remote, true).await?;
            for dir in &tree.dirs {
                self.client
                    .makedirs(&join_remote(&remote, &local_to_remote(dir)), true)
                    .await?;
            }
            for file in tree.files {
                let target = join_remote(&remote, &local_to_remote(&file.relative_path));
                items.push(BatchItem::upload(file.local_path, target));
            }
        }

        info!("上传规划完成: {} 个文件 -> '{}'", items.len(), remote_dir);
        Ok(items)
    }

    /// 规划下载
    ///
    /// # 参数
    /// * `remote_paths` - 网盘文件或目录
    /// * `local_dir` - 本地目标目录
    /// * `recursive` - 是否允许下载目录
    pub async fn plan_download(
        &self,
        remote_paths: &[String],
        local_dir: &Path,
        recursive: bool,
    ) -> Result<Vec<BatchItem>> {
        let mut items = Vec::new();
        for remote in remote_paths {
            let remote = normalize_remote_path(remote);
            let name = if remote.is_empty() {
                "root".to_string()
            } else {
                remote_basename(&remote)
            };
            let local_root = local_dir.join(&name);
            let transfer = Transfer::Download {
                remote: remote.clone(),
                local: local_root.clone(),
            };

            let item = match self.client.metadata(&remote).await {
                Ok(item) => item,
                Err(e) => {
                    items.push(rejected(transfer, e.to_string()));
                    continue;
                }
            };
            if !item.is_dir() {
                items.push(BatchItem::new(transfer));
                continue;
            }
            if !recursive {
                let err = DriveError::IsADirectory(remote);
                items.push(rejected(transfer, format!("{}，下载目录需要 -r", err)));
                continue;
            }

            let (dirs, files) = match self.walk_remote(&remote).await {
                Ok(tree) => tree,
                Err(e) => {
                    items.push(rejected(transfer, format!("{:#}", e)));
                    continue;
                }
            };
            for dir in std::iter::once(String::new()).chain(dirs) {
                let path = join_local(&local_root, &dir);
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| DriveError::local_io(&path, e))?;
            }
            for relative in files {
                let local = join_local(&local_root, &relative);
                items.push(BatchItem::download(join_remote(&remote, &relative), local));
            }
        }

        info!("下载规划完成: {} 个文件 -> {}", items.len(), local_dir.display());
        Ok(items)
    }

    /// 遍历网盘目录
    ///
    /// # 返回
    /// (子目录相对路径, 文件相对路径)，均按路径排序
    async fn walk_remote(&self, root: &str) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut dirs = BTreeSet::new();
        let mut files = BTreeSet::new();
        let mut pending = vec![String::new()];

        while let Some(relative) = pending.pop() {
            let children: Vec<DriveItem> = self.client.children(&join_remote(root, &relative)).await?;
            for child in children {
                let child_path = join_remote(&relative, &child.name);
                if child.is_dir() {
                    pending.push(child_path.clone());
                    dirs.insert(child_path);
                } else {
                    files.insert(child_path);
                }
            }
        }
        debug!("'{}' 下共 {} 个目录, {} 个文件", root, dirs.len(), files.len());
        Ok((dirs, files))
    }

    /// 计算移动 / 复制的 (源, 目标) 列表
    pub async fn plan_relocation(
        &self,
        paths: &[String],
        mode: TargetMode,
    ) -> Result<Vec<(String, String)>> {
        if paths.len() < 2 {
            bail!("至少需要两个路径");
        }

        let into_dir = |dir: &str, sources: &[String]| {
            sources
                .iter()
                .map(|src| (normalize_remote_path(src), join_remote(dir, &remote_basename(src))))
                .collect::<Vec<_>>()
        };

        match (mode, paths) {
            (TargetMode::NoTargetDirectory, [src, dst]) => {
                Ok(vec![(normalize_remote_path(src), normalize_remote_path(dst))])
            }
            (TargetMode::NoTargetDirectory, _) => bail!("-T 只能用于单个源路径"),
            (TargetMode::TargetDirectory, [dir, sources @ ..]) => Ok(into_dir(dir.as_str(), sources)),
            (TargetMode::Auto, [src, dst]) => {
                if self.client.is_dir(dst).await? {
                    Ok(into_dir(dst.as_str(), std::slice::from_ref(src)))
                } else {
                    Ok(vec![(normalize_remote_path(src), normalize_remote_path(dst))])
                }
            }
            (TargetMode::Auto, [sources @ .., dir]) => Ok(into_dir(dir.as_str(), sources)),
            _ => bail!("至少需要两个路径"),
        }
    }
}

/// 规划阶段无法处理的路径
fn rejected(transfer: Transfer, reason: String) -> BatchItem {
    warn!("跳过 {:?}: {}", transfer, reason);
    BatchItem::failed(transfer, reason)
}

/// 网盘相对路径拼到本地目录下
fn join_local(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
