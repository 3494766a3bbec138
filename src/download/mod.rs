//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`        — 数据模型（Book / ChapterIndexEntry / DownloadTask / DownloadEvent 等）
//! - `error`         — 任务级错误分类
//! - `orchestrator`  — 单线程下载队列与暂停/停止控制
//! - `progress`      — CLI 进度条

pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
