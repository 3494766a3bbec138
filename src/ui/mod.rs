//! 交互层入口。
//!
//! 目前只有无界面的命令行实现。

pub mod noui;
