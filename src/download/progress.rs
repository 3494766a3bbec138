//! CLI 进度条：消费 DownloadEvent，每本书一条进度条。

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::models::{DownloadEvent, EventStatus};

const BAR_TEMPLATE: &str = "{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}";

/// 一批下载的最终统计。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

impl BatchSummary {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.stopped
    }
}

pub struct ProgressBoard {
    mp: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<String, ProgressBar>,
    summary: BatchSummary,
}

impl ProgressBoard {
    pub fn new(hidden: bool) -> Self {
        let target = if hidden {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stdout()
        };
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        Self {
            mp: MultiProgress::with_draw_target(target),
            style,
            bars: HashMap::new(),
            summary: BatchSummary::default(),
        }
    }

    pub fn summary(&self) -> BatchSummary {
        self.summary
    }

    /// 更新对应书籍的进度条，返回事件是否为终态。
    pub fn handle(&mut self, event: &DownloadEvent, title: &str) -> bool {
        // ProgressBar 内部是 Arc，克隆后即可同时更新 summary
        let bar = self.bar(&event.book_id, title).clone();
        if event.chapter_total > 0 {
            bar.set_length(event.chapter_total as u64);
        }

        match event.status {
            EventStatus::Started => bar.set_message("获取目录"),
            EventStatus::BookUpdated => {
                if let Some(book) = event.book.as_ref() {
                    bar.set_prefix(book.display_name().to_string());
                }
            }
            EventStatus::Progress => {
                bar.set_position(event.chapter_offset as u64);
                bar.set_message(event.message.clone());
            }
            EventStatus::Paused => bar.set_message("已暂停"),
            EventStatus::Completed => {
                self.summary.completed += 1;
                bar.set_position(event.chapter_offset as u64);
                bar.finish_with_message("完成");
            }
            EventStatus::Failed => {
                self.summary.failed += 1;
                bar.abandon_with_message(format!("失败: {}", event.message));
            }
            EventStatus::Stopped => {
                self.summary.stopped += 1;
                bar.abandon_with_message("已停止");
            }
        }
        event.is_terminal()
    }

    /// 进度条之外打印一行，避免与重绘冲突。
    pub fn println(&self, line: impl AsRef<str>) {
        let _ = self.mp.println(line);
    }

    fn bar(&mut self, book_id: &str, title: &str) -> &ProgressBar {
        self.bars.entry(book_id.to_string()).or_insert_with(|| {
            let bar = self.mp.add(ProgressBar::new(0));
            bar.set_style(self.style.clone());
            bar.set_prefix(if title.is_empty() {
                book_id.to_string()
            } else {
                title.to_string()
            });
            bar
        })
    }
}
