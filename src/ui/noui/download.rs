//! `download` 子命令：批量入队、渲染进度，并从标准输入接收暂停/继续/停止指令。

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, select};
use tracing::{info, warn};

use super::resolve_book_ids;
use crate::base_system::book_id::parse_book_id;
use crate::base_system::context::Config;
use crate::base_system::logging::LogSystem;
use crate::book_parser::archive::ArchiveStore;
use crate::book_parser::shelf::Shelf;
use crate::download::models::{Book, DownloadTask, EventStatus, TaskState};
use crate::download::orchestrator::{EnqueueOutcome, Orchestrator, OrchestratorSettings};
use crate::download::progress::ProgressBoard;
use crate::network_parser::transport::HttpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Stop,
    /// 移除某本书（正在下载则停止）
    Cancel(String),
    List,
    Quit,
}

impl Control {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next()?.to_ascii_lowercase();
        let arg = parts.next();
        match (cmd.as_str(), arg) {
            ("p" | "pause", None) => Some(Control::Pause),
            ("r" | "resume", None) => Some(Control::Resume),
            ("s" | "stop", None) => Some(Control::Stop),
            ("l" | "list", None) => Some(Control::List),
            ("q" | "quit", None) => Some(Control::Quit),
            ("c" | "cancel", Some(book)) => parse_book_id(book).map(Control::Cancel),
            _ => None,
        }
    }
}

fn task_line(task: &DownloadTask) -> String {
    let state = match task.state {
        TaskState::Queued => "排队中",
        TaskState::Active => "下载中",
        TaskState::Paused => "已暂停",
        TaskState::Completed => "已完成",
        TaskState::Failed => "失败",
    };
    format!(
        "  [{}] {} ({}) 第 {} 章",
        state,
        task.book.display_name(),
        task.book.id,
        task.cursor
    )
}

/// 返回的 Sender 由调用方持有，标准输入 EOF 后通道也不会断开。
fn spawn_control_reader() -> (Sender<Control>, Receiver<Control>) {
    let (keep, rx) = crossbeam_channel::unbounded();
    let tx = keep.clone();
    let spawned = thread::Builder::new()
        .name("stdin-control".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Some(cmd) = Control::parse(&line) {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        warn!(target: "download", "无法监听标准输入: {err}");
    }
    (keep, rx)
}

pub fn run_download(config: &Config, log: &LogSystem, inputs: &[String]) -> Result<()> {
    let ids = resolve_book_ids(inputs)?;
    let base = config.default_save_dir();
    let archive = ArchiveStore::new(&base);
    let mut shelf = Shelf::load(config.shelf_path()).context("读取本地书架失败")?;
    let mut local = Shelf::load(config.local_path()).context("读取已下载列表失败")?;
    let transport = HttpTransport::new(config).context("初始化 HTTP 客户端失败")?;

    let (orch, events) = Orchestrator::start(
        Box::new(transport),
        archive,
        OrchestratorSettings::from_config(config),
    )
    .context("启动下载线程失败")?;
    let orch = Arc::new(orch);
    {
        let orch = Arc::clone(&orch);
        log.add_exit_hook(move || orch.shutdown());
    }

    let mut titles: HashMap<String, String> = HashMap::new();
    let mut expected = 0;
    for id in &ids {
        let book = shelf
            .get(id)
            .or_else(|| local.get(id))
            .cloned()
            .unwrap_or_else(|| Book::new(id.as_str(), ""));
        titles.insert(id.clone(), book.display_name().to_string());
        match orch.enqueue(book.clone()) {
            EnqueueOutcome::Queued | EnqueueOutcome::AlreadyComplete => {
                expected += 1;
                local.add(book);
            }
            EnqueueOutcome::AlreadyQueued => {}
        }
    }
    if let Err(err) = local.save() {
        warn!(target: "download", "保存已下载列表失败: {err}");
    }

    println!(
        "已加入 {} 本书，保存到 {}\n指令：p 暂停 | r 继续 | s 停止当前 | c <书籍ID> 移除 | l 队列 | q 退出",
        expected,
        base.display()
    );
    info!(target: "download", count = expected, "开始批量下载");

    let start = Instant::now();
    let mut board = ProgressBoard::new(false);
    let (_keep_controls, controls) = spawn_control_reader();

    while board.summary().finished() < expected {
        select! {
            recv(events) -> ev => {
                let Ok(ev) = ev else { break };
                if ev.status == EventStatus::BookUpdated {
                    if let Some(book) = ev.book.clone() {
                        titles.insert(book.id.clone(), book.display_name().to_string());
                        // 书架只更新已有条目；已下载列表总是记录最新信息
                        if shelf.get(&book.id).is_some() {
                            shelf.upsert(book.clone());
                            if let Err(err) = shelf.save() {
                                warn!(target: "download", "保存书架失败: {err}");
                            }
                        }
                        local.upsert(book);
                        if let Err(err) = local.save() {
                            warn!(target: "download", "保存已下载列表失败: {err}");
                        }
                    }
                }
                let title = titles.get(&ev.book_id).map(String::as_str).unwrap_or("");
                board.handle(&ev, title);
            }
            recv(controls) -> cmd => match cmd {
                Ok(Control::Pause) => {
                    orch.pause();
                    board.println("已暂停（当前章节结束后生效），输入 r 继续");
                }
                Ok(Control::Resume) => {
                    if orch.is_paused() {
                        orch.resume();
                    } else {
                        board.println("当前未暂停");
                    }
                }
                Ok(Control::Cancel(book_id)) => {
                    if !orch.cancel(&book_id) {
                        board.println(format!("队列中没有 {book_id}"));
                    }
                }
                Ok(Control::List) => {
                    if orch.is_idle() {
                        board.println("队列为空");
                    }
                    for task in orch.tasks() {
                        board.println(task_line(&task));
                    }
                }
                Ok(Control::Stop) => {
                    if !orch.stop() {
                        board.println("当前没有正在下载的书");
                    }
                }
                Ok(Control::Quit) => {
                    board.println("正在退出…");
                    orch.shutdown();
                    break;
                }
                Err(_) => {}
            }
        }
    }

    let summary = board.summary();
    println!(
        "\n完成 {} 本，失败 {} 本，停止 {} 本，用时 {:.1}s",
        summary.completed,
        summary.failed,
        summary.stopped,
        start.elapsed().as_secs_f64()
    );
    orch.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("p", Some(Control::Pause))]
    #[case(" R \n", Some(Control::Resume))]
    #[case("stop", Some(Control::Stop))]
    #[case("q", Some(Control::Quit))]
    #[case("l", Some(Control::List))]
    #[case("c 3300107269", Some(Control::Cancel("3300107269".to_string())))]
    #[case("cancel https://weread.qq.com/web/reader/x?bookId=CB_9z", Some(Control::Cancel("CB_9z".to_string())))]
    #[case("c", None)]
    #[case("p now", None)]
    #[case("x", None)]
    fn control_commands(#[case] line: &str, #[case] expected: Option<Control>) {
        assert_eq!(Control::parse(line), expected);
    }
}
