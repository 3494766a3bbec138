//! 章节内容与本地存储模块入口。
//!
//! 负责章节正文解扰、按书籍落盘（books/<book_id>/）以及书架同步与持久化。

pub mod archive;
pub mod descrambler;
pub mod shelf;
