//! 下载调度：单个后台线程按 FIFO 顺序逐本下载。
//!
//! 任务记录存放在 arena（`Vec<Option<DownloadTask>>`）中，队列只保存下标。
//! 暂停/停止是在章节边界检查的标志位；暂停时用 Condvar 等待，并按固定间隔上报 paused 事件。
//! 进度不落盘：重新入队时由 ArchiveStore 中已存在的章节文件决定从哪里继续。

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::error::DownloadError;
use super::models::{
    Book, ChapterIndexEntry, DownloadEvent, DownloadTask, EventStatus, TaskState,
};
use crate::base_system::context::Config;
use crate::base_system::retry::{RetryPolicy, with_retry_if};
use crate::book_parser::archive::ArchiveStore;
use crate::book_parser::descrambler::assemble;
use crate::network_parser::page_parser::{PageState, parse_catalog_locks, parse_page_state};
use crate::network_parser::signer::build_chapter_request;
use crate::network_parser::transport::{Transport, TransportError, chapter_content_urls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// 章节之间的固定间隔（限速），暂停与否都生效。
    pub download_delay: Duration,
    pub pause_tick: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(cfg),
            download_delay: cfg.download_delay(),
            pause_tick: cfg.pause_tick(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// 同一本书已在队列中或正在下载。
    AlreadyQueued,
    /// 本地已完整，直接上报 completed，不发起网络请求。
    AlreadyComplete,
}

#[derive(Default)]
struct QueueState {
    tasks: Vec<Option<DownloadTask>>,
    queue: VecDeque<usize>,
    active: Option<usize>,
    paused: bool,
    stop_current: bool,
    shutdown: bool,
}

impl QueueState {
    fn contains(&self, book_id: &str) -> bool {
        self.tasks
            .iter()
            .flatten()
            .any(|t| t.book.id == book_id && !t.state.is_terminal())
    }

    fn insert(&mut self, task: DownloadTask) -> usize {
        if let Some(slot) = self.tasks.iter().position(Option::is_none) {
            self.tasks[slot] = Some(task);
            slot
        } else {
            self.tasks.push(Some(task));
            self.tasks.len() - 1
        }
    }

    fn task_mut(&mut self, slot: usize) -> Option<&mut DownloadTask> {
        self.tasks.get_mut(slot).and_then(Option::as_mut)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
    events: Sender<DownloadEvent>,
    archive: ArchiveStore,
    settings: OrchestratorSettings,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: DownloadEvent) {
        // 观察者全部退出时丢弃事件即可
        let _ = self.events.send(event);
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// 启动下载线程。返回的 Receiver 按书内章节顺序收到全部事件。
    pub fn start(
        transport: Box<dyn Transport>,
        archive: ArchiveStore,
        settings: OrchestratorSettings,
    ) -> io::Result<(Self, Receiver<DownloadEvent>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            events: tx,
            archive,
            settings,
        });

        let worker = Worker {
            shared: Arc::clone(&shared),
            transport,
        };
        let handle = thread::Builder::new()
            .name("download-worker".to_string())
            .spawn(move || worker.run())?;

        Ok((
            Self {
                shared,
                worker: Mutex::new(Some(handle)),
            },
            rx,
        ))
    }

    pub fn enqueue(&self, book: Book) -> EnqueueOutcome {
        let book = book.ensure_obfuscated_id();
        let mut st = self.shared.lock();
        if st.contains(&book.id) {
            debug!(target: "download", book_id = %book.id, "已在队列中，忽略");
            return EnqueueOutcome::AlreadyQueued;
        }

        match self.shared.archive.compute_progress(&book.id) {
            Ok(p) if p.complete && p.total > 0 => {
                info!(target: "download", book_id = %book.id, "本地已下载完成，跳过: {}", book.display_name());
                self.shared.emit(DownloadEvent::new(
                    EventStatus::Completed,
                    &book.id,
                    p.total,
                    p.total,
                    "本地已完整",
                ));
                return EnqueueOutcome::AlreadyComplete;
            }
            Ok(_) => {}
            Err(err) => warn!(target: "download", book_id = %book.id, "读取本地进度失败: {err}"),
        }

        info!(target: "download", book_id = %book.id, "加入下载队列: {}", book.display_name());
        let slot = st.insert(DownloadTask::new(book));
        st.queue.push_back(slot);
        self.shared.cond.notify_all();
        EnqueueOutcome::Queued
    }

    /// 当前章节结束后暂停。
    pub fn pause(&self) {
        let mut st = self.shared.lock();
        st.paused = true;
        info!(target: "download", "已请求暂停");
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock();
        if st.paused {
            st.paused = false;
            info!(target: "download", "继续下载");
        }
        self.shared.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// 在下一个章节边界结束当前任务（不打断进行中的请求）。
    pub fn stop(&self) -> bool {
        let mut st = self.shared.lock();
        if st.active.is_none() {
            return false;
        }
        st.stop_current = true;
        self.shared.cond.notify_all();
        true
    }

    /// 从队列中移除某本书；若正在下载则停止它。
    pub fn cancel(&self, book_id: &str) -> bool {
        let mut st = self.shared.lock();
        let active_matches = st
            .active
            .and_then(|slot| st.tasks.get(slot).and_then(Option::as_ref))
            .is_some_and(|t| t.book.id == book_id);
        if active_matches {
            st.stop_current = true;
            self.shared.cond.notify_all();
            return true;
        }

        let QueueState { tasks, queue, .. } = &mut *st;
        let before = queue.len();
        queue.retain(|&slot| {
            let hit = tasks[slot].as_ref().is_some_and(|t| t.book.id == book_id);
            if hit {
                tasks[slot] = None;
            }
            !hit
        });
        if before == queue.len() {
            return false;
        }
        info!(target: "download", book_id = %book_id, "已从队列移除");
        self.shared.emit(DownloadEvent::new(
            EventStatus::Stopped,
            book_id,
            0,
            0,
            "已从队列移除",
        ));
        true
    }

    /// 队列中与正在下载的任务快照（按入队顺序，正在下载的在前）。
    pub fn tasks(&self) -> Vec<DownloadTask> {
        let st = self.shared.lock();
        st.active
            .into_iter()
            .chain(st.queue.iter().copied())
            .filter_map(|slot| st.tasks.get(slot).and_then(Option::clone))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let st = self.shared.lock();
        st.active.is_none() && st.queue.is_empty()
    }

    /// 清空队列、停止当前任务并等待下载线程退出。
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            st.queue.clear();
            self.shared.cond.notify_all();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "download", "下载线程异常退出");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 正在处理的章节下标与目录长度，失败事件据此给出位置。
#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    current: Option<usize>,
    total: usize,
}

impl Cursor {
    fn offset(&self) -> usize {
        self.current.map_or(0, |i| i + 1)
    }
}

struct Worker {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
}

impl Worker {
    fn run(self) {
        debug!(target: "download", "下载线程已启动");
        while let Some((slot, book)) = self.next_task() {
            self.process(slot, book);
        }
        debug!(target: "download", "下载线程退出");
    }

    fn next_task(&self) -> Option<(usize, Book)> {
        let mut st = self.shared.lock();
        loop {
            if st.shutdown {
                return None;
            }
            if let Some(slot) = st.queue.pop_front() {
                st.active = Some(slot);
                st.stop_current = false;
                if let Some(task) = st.task_mut(slot) {
                    task.state = TaskState::Active;
                    return Some((slot, task.book.clone()));
                }
                st.active = None;
                continue;
            }
            st = self
                .shared
                .cond
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn process(&self, slot: usize, mut book: Book) {
        info!(target: "download", book_id = %book.id, "开始下载: {}", book.display_name());
        self.shared.emit(DownloadEvent::new(
            EventStatus::Started,
            &book.id,
            0,
            0,
            book.display_name(),
        ));

        let mut cursor = Cursor::default();
        let result = self.download_book(slot, &mut book, &mut cursor);

        let (state, event) = match result {
            Ok(()) => {
                info!(target: "download", book_id = %book.id, total = cursor.total, "下载完成: {}", book.display_name());
                (
                    TaskState::Completed,
                    DownloadEvent::new(
                        EventStatus::Completed,
                        &book.id,
                        cursor.total,
                        cursor.total,
                        "下载完成",
                    ),
                )
            }
            Err(DownloadError::Canceled) => {
                info!(target: "download", book_id = %book.id, "下载已停止: {}", book.display_name());
                (
                    TaskState::Failed,
                    DownloadEvent::new(
                        EventStatus::Stopped,
                        &book.id,
                        cursor.current.unwrap_or(0),
                        cursor.total,
                        DownloadError::Canceled.to_string(),
                    ),
                )
            }
            Err(err) => {
                error!(target: "download", book_id = %book.id, offset = cursor.offset(), "下载失败: {err}");
                (
                    TaskState::Failed,
                    DownloadEvent::new(
                        EventStatus::Failed,
                        &book.id,
                        cursor.offset(),
                        cursor.total,
                        err.to_string(),
                    ),
                )
            }
        };

        let mut st = self.shared.lock();
        if let Some(task) = st.task_mut(slot) {
            task.state = state;
            if event.status == EventStatus::Failed {
                task.last_error = Some(event.message.clone());
            }
        }
        self.shared.emit(event);
        // 终态任务直接从 arena 中移除
        st.tasks[slot] = None;
        st.active = None;
    }

    fn download_book(
        &self,
        slot: usize,
        book: &mut Book,
        cursor: &mut Cursor,
    ) -> Result<(), DownloadError> {
        let archive = &self.shared.archive;
        let (index, page) = self.fetch_index(book)?;
        cursor.total = index.len();

        if fill_from_page(book, &page) {
            let mut event =
                DownloadEvent::new(EventStatus::BookUpdated, &book.id, 0, index.len(), "书籍信息已更新");
            event.book = Some(book.clone());
            self.update_task(slot, |t| t.book = book.clone());
            self.shared.emit(event);
        }
        archive.write_book_info(book)?;
        archive.write_chapter_index(&book.id, &index)?;

        let format = book.effective_format();
        let urls = chapter_content_urls(format);
        // pclts：每个任务取一次当前时间戳
        let pclts = OffsetDateTime::now_utc().unix_timestamp().to_string();
        let total = index.len();

        for (i, entry) in index.iter().enumerate() {
            self.checkpoint(slot, &book.id, i, total)?;
            cursor.current = Some(i);

            if archive.has_chapter(&book.id, &entry.chapter_id, format) {
                debug!(target: "download", book_id = %book.id, chapter_id = %entry.chapter_id, "章节已存在，跳过");
                self.report_progress(slot, &book.id, i, total, "已存在");
                continue;
            }

            // 第 i 章是否可读由第 i-1 个目录项的锁定标记决定
            let gate = &index[i.saturating_sub(1)];
            if gate.locked {
                return Err(DownloadError::AccessDenied {
                    index: i,
                    chapter_id: entry.chapter_id.clone(),
                });
            }

            let params = build_chapter_request(&book.id, &entry.chapter_id, &page.psvts, &pclts);
            let mut parts = Vec::with_capacity(urls.len());
            for url in &urls {
                let body = with_retry_if(
                    self.shared.settings.retry,
                    "chapter",
                    TransportError::is_transient,
                    || self.transport.post_signed(url, &params),
                )
                .map_err(|e| DownloadError::Transport {
                    attempts: e.attempts,
                    source: e.last,
                })?;
                parts.push(body);
            }

            let chapter = assemble(format, &parts)?;
            archive.write_chapter(&book.id, &entry.chapter_id, format, &chapter.content)?;
            debug!(target: "download", book_id = %book.id, chapter = i + 1, total, "章节已保存: {}", entry.title);
            self.report_progress(slot, &book.id, i, total, &entry.title);

            let delay = self.shared.settings.download_delay;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        Ok(())
    }

    /// 拉取目录与阅读页；阅读页中的目录锁定标记按位置叠加到目录上。
    fn fetch_index(
        &self,
        book: &Book,
    ) -> Result<(Vec<ChapterIndexEntry>, PageState), DownloadError> {
        let policy = self.shared.settings.retry;
        let mut index = with_retry_if(policy, "chapter index", TransportError::is_transient, || {
            self.transport.fetch_chapter_index(&book.id)
        })
        .map_err(|e| DownloadError::IndexFetch(e.last.to_string()))?;

        let html = with_retry_if(policy, "reader page", TransportError::is_transient, || {
            self.transport.fetch_page_metadata(&book.id)
        })
        .map_err(|e| DownloadError::IndexFetch(e.last.to_string()))?;
        let page = parse_page_state(&html).map_err(|e| DownloadError::IndexFetch(e.to_string()))?;

        let levels: Vec<u32> = index
            .iter()
            .map(|e| e.level)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let locks = parse_catalog_locks(&html, &levels)
            .map_err(|e| DownloadError::IndexFetch(e.to_string()))?;
        // 缺少锁定信息的章节无法判断能否阅读
        if locks.len() < index.len() {
            return Err(DownloadError::IndexFetch(format!(
                "阅读页目录只有 {} 项，目录共 {} 章",
                locks.len(),
                index.len()
            )));
        }
        if locks.len() > index.len() {
            warn!(target: "download", book_id = %book.id, catalog = locks.len(), index = index.len(), "目录锁定信息多于目录长度");
        }
        for (entry, locked) in index.iter_mut().zip(locks) {
            entry.locked |= locked;
        }

        debug!(target: "download", book_id = %book.id, chapters = index.len(), "目录获取成功");
        Ok((index, page))
    }

    /// 章节边界：处理停止与暂停。暂停期间按 pause_tick 上报 paused 事件。
    fn checkpoint(
        &self,
        slot: usize,
        book_id: &str,
        offset: usize,
        total: usize,
    ) -> Result<(), DownloadError> {
        let tick = self.shared.settings.pause_tick;
        let mut st = self.shared.lock();
        let mut announce = true;
        loop {
            if st.shutdown || st.stop_current {
                return Err(DownloadError::Canceled);
            }
            if !st.paused {
                if let Some(task) = st.task_mut(slot) {
                    task.state = TaskState::Active;
                }
                return Ok(());
            }
            if let Some(task) = st.task_mut(slot) {
                task.state = TaskState::Paused;
            }
            if announce {
                self.shared.emit(DownloadEvent::new(
                    EventStatus::Paused,
                    book_id,
                    offset,
                    total,
                    "已暂停",
                ));
            }
            let (guard, waited) = self
                .shared
                .cond
                .wait_timeout(st, tick)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            announce = waited.timed_out();
        }
    }

    fn report_progress(&self, slot: usize, book_id: &str, i: usize, total: usize, msg: &str) {
        self.update_task(slot, |t| t.cursor = i + 1);
        self.shared
            .emit(DownloadEvent::new(EventStatus::Progress, book_id, i + 1, total, msg));
    }

    fn update_task(&self, slot: usize, f: impl FnOnce(&mut DownloadTask)) {
        let mut st = self.shared.lock();
        if let Some(task) = st.task_mut(slot) {
            f(task);
        }
    }
}

/// 用阅读页信息补齐未知字段，返回是否有变化。
fn fill_from_page(book: &mut Book, page: &PageState) -> bool {
    let mut changed = false;
    if book.format.is_none() && page.format.is_some() {
        book.format = page.format;
        changed = true;
    }
    if book.language.is_none() && page.language.is_some() {
        book.language = page.language.clone();
        changed = true;
    }
    let mut fill = |dst: &mut String, src: &Option<String>| {
        if dst.trim().is_empty() {
            if let Some(v) = src.as_ref().filter(|v| !v.trim().is_empty()) {
                *dst = v.clone();
                changed = true;
            }
        }
    };
    fill(&mut book.title, &page.title);
    fill(&mut book.author, &page.author);
    if book.cover_url.is_none() && page.cover.is_some() {
        book.cover_url = page.cover.clone();
        changed = true;
    }
    changed
}
