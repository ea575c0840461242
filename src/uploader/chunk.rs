// 上传分片划分
//
// OneDrive 上传会话的分片规则：
// - 分片按偏移顺序连续发送，覆盖 [0, size)，无空洞、无重叠
// - 除最后一个分片外，大小均为 chunk_size
// - 单个分片不超过 60MB，建议为 320KB 的整数倍

use std::ops::Range;

/// 默认上传分片大小: 10MB（320KB 的 32 倍）
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 分片索引（从 0 开始）
    pub index: usize,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
    /// 是否为最后一个分片
    pub is_final: bool,
}

impl Segment {
    pub fn offset(&self) -> u64 {
        self.range.start
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Content-Range 请求头: `bytes {start}-{end-1}/{total}`
    pub fn content_range(&self, total: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            self.range.start,
            self.range.end - 1,
            total
        )
    }
}

/// 一个文件的分片计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub file_size: u64,
    pub chunk_size: u64,
}

impl SegmentPlan {
    /// # 参数
    /// * `file_size` - 文件大小
    /// * `chunk_size` - 分片大小（必须大于 0，由配置校验保证）
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            chunk_size: chunk_size.max(1),
        }
    }

    /// 分片总数（0 字节文件为 0）
    pub fn segment_count(&self) -> usize {
        self.file_size.div_ceil(self.chunk_size) as usize
    }

    /// 从指定偏移开始的分片
    ///
    /// 偏移由服务端确认的字节数决定，不一定落在分片边界上；
    /// 不在边界上时，本分片截止到下一个边界，之后重新对齐
    pub fn segment_at(&self, offset: u64) -> Option<Segment> {
        if offset >= self.file_size {
            return None;
        }
        let index = (offset / self.chunk_size) as usize;
        let boundary = (index as u64 + 1) * self.chunk_size;
        let end = boundary.min(self.file_size);
        Some(Segment {
            index,
            range: offset..end,
            is_final: end == self.file_size,
        })
    }

    /// 全部分片
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::with_capacity(self.segment_count());
        let mut offset = 0;
        while let Some(segment) = self.segment_at(offset) {
            offset = segment.range.end;
            segments.push(segment);
        }
        segments
    }
}
