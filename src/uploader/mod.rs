// 上传引擎模块
//
// - 分片规划：按配置的分片大小切分文件
// - 上传会话：跟踪服务端确认的字节数，中断后按服务端记录续传
// - 分片传输：单次 PUT 的结果分类（前进 / 完成 / 可重试 / 致命）
// - 上传工作者：状态机 + 指数退避重试 + 会话过期重建

pub mod chunk;
pub mod engine;
pub mod reader;
pub mod session;
pub mod transfer;

pub use chunk::{Segment, SegmentPlan, DEFAULT_CHUNK_SIZE};
pub use engine::{
    calculate_backoff_delay, upload_file, FailureStage, ProgressEvent, UploadState,
    UploadSummary, UploadWorker, WorkerContext, WorkerFailure,
};
pub use reader::{source_for, SegmentBody, SegmentSource};
pub use session::{SavedSession, SavedSessionStore, UploadSession};
pub use transfer::{send_segment, RetryReason, TransferOutcome};
