// 批量任务模块
//
// - item: 批量任务项与状态
// - planner: 目录树展开为扁平任务列表
// - orchestrator: 有界并发执行与汇总报告

pub mod item;
pub mod orchestrator;
pub mod planner;

pub use item::{BatchItem, BatchKind, ItemStatus, Transfer};
pub use orchestrator::{BatchOrchestrator, BatchReport, INTERRUPTED_BEFORE_START};
pub use planner::{scan_local, BatchPlanner, LocalTree, ScanOptions, ScannedFile, TargetMode};
