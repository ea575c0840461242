// 批量任务项

use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Upload,
    Download,
}

/// 任务项状态
///
/// 进入 Succeeded / Failed 后不再改变
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed(String),
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Succeeded | ItemStatus::Failed(_))
    }
}

/// 传输端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
}

/// 批量任务中的一项
#[derive(Debug)]
pub struct BatchItem {
    id: Uuid,
    transfer: Transfer,
    status: Mutex<ItemStatus>,
}

impl BatchItem {
    pub fn new(transfer: Transfer) -> Self {
        Self {
            id: Uuid::new_v4(),
            transfer,
            status: Mutex::new(ItemStatus::Pending),
        }
    }

    /// 规划阶段就已失败的任务项，调度器不会执行它
    pub fn failed(transfer: Transfer, reason: impl Into<String>) -> Self {
        let item = Self::new(transfer);
        item.finish(Err(reason.into()));
        item
    }

    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self::new(Transfer::Upload {
            local: local.into(),
            remote: remote.into(),
        })
    }

    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self::new(Transfer::Download {
            remote: remote.into(),
            local: local.into(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn kind(&self) -> BatchKind {
        match self.transfer {
            Transfer::Upload { .. } => BatchKind::Upload,
            Transfer::Download { .. } => BatchKind::Download,
        }
    }

    pub fn source(&self) -> String {
        match &self.transfer {
            Transfer::Upload { local, .. } => local.display().to_string(),
            Transfer::Download { remote, .. } => remote.clone(),
        }
    }

    pub fn destination(&self) -> String {
        match &self.transfer {
            Transfer::Upload { remote, .. } => remote.clone(),
            Transfer::Download { local, .. } => local.display().to_string(),
        }
    }

    pub fn status(&self) -> ItemStatus {
        self.status.lock().clone()
    }

    /// Pending -> InProgress
    pub fn start(&self) -> bool {
        let mut status = self.status.lock();
        if *status != ItemStatus::Pending {
            return false;
        }
        *status = ItemStatus::InProgress;
        true
    }

    /// 设置终态，已是终态时忽略
    pub fn finish(&self, result: Result<(), String>) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        *status = match result {
            Ok(()) => ItemStatus::Succeeded,
            Err(reason) => ItemStatus::Failed(reason),
        };
        true
    }
}

impl fmt::Display for BatchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.kind() {
            BatchKind::Upload => "=>",
            BatchKind::Download => "<=",
        };
        match &self.transfer {
            Transfer::Upload { local, remote } => {
                write!(f, "{} {} {}", local.display(), arrow, remote)
            }
            Transfer::Download { remote, local } => {
                write!(f, "{} {} {}", local.display(), arrow, remote)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_status_is_set_once() {
        let item = BatchItem::upload("/tmp/a.bin", "backup/a.bin");
        assert_eq!(item.status(), ItemStatus::Pending);
        assert!(item.start());
        assert!(!item.start());

        assert!(item.finish(Err("HTTP 507".to_string())));
        assert!(!item.finish(Ok(())));
        assert_eq!(item.status(), ItemStatus::Failed("HTTP 507".to_string()));
    }

    #[test]
    fn test_pending_item_can_fail_without_start() {
        let item = BatchItem::download("docs/a.txt", "/tmp/a.txt");
        assert_eq!(item.kind(), BatchKind::Download);
        assert_eq!(item.source(), "docs/a.txt");
        assert!(item.finish(Err("interrupted before start".to_string())));
        assert!(item.status().is_terminal());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = BatchItem::upload("a", "a");
        let b = BatchItem::upload("a", "a");
        assert_ne!(a.id(), b.id());
    }
}
