// 下载引擎模块
//
// 单文件下载：.part 临时文件 + Range 续传 + 大小 / SHA-1 校验

pub mod engine;

pub use engine::{part_path, DownloadFailure, DownloadSummary, DownloadWorker};
