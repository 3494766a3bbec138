//! 下载相关的数据模型定义。
//!
//! 包含书籍（Book）、目录条目、下载任务状态机以及推送给观察者的进度事件。
//! JSON 字段名与服务端/历史 `info.json`、`chapters.json` 保持一致。

use serde::{Deserialize, Deserializer, Serialize};

use crate::network_parser::signer::obfuscate_id;

/// 书籍正文格式。`epub` 之外的任何取值都按纯文本处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    Epub,
    Txt,
}

impl BookFormat {
    pub fn from_remote(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("epub") {
            BookFormat::Epub
        } else {
            BookFormat::Txt
        }
    }

    /// 章节文件扩展名（不含点）。
    pub fn extension(self) -> &'static str {
        match self {
            BookFormat::Epub => "xhtml",
            BookFormat::Txt => "txt",
        }
    }

    /// 正文接口分片数：epub 四段（第 3 段为样式表），txt 两段。
    pub fn part_count(self) -> usize {
        match self {
            BookFormat::Epub => 4,
            BookFormat::Txt => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(rename = "bookId", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(
        default,
        deserialize_with = "lenient_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub format: Option<BookFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "cover", default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(rename = "bookHash", default)]
    obfuscated_id: String,
}

impl Book {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let obfuscated_id = obfuscate_id(&id);
        Self {
            id,
            title: title.into(),
            author: String::new(),
            format: None,
            language: None,
            cover_url: None,
            obfuscated_id,
        }
    }

    /// 派生标识只计算一次；反序列化得到的记录若缺失则在此补齐。
    pub fn obfuscated_id(&mut self) -> &str {
        if self.obfuscated_id.is_empty() {
            self.obfuscated_id = obfuscate_id(&self.id);
        }
        &self.obfuscated_id
    }

    pub fn ensure_obfuscated_id(mut self) -> Self {
        self.obfuscated_id();
        self
    }

    /// 格式未知时按 txt 处理（与服务端默认一致）。
    pub fn effective_format(&self) -> BookFormat {
        self.format.unwrap_or(BookFormat::Txt)
    }

    pub fn display_name(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// 目录条目。`locked` 来自阅读页目录的锁定标记。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterIndexEntry {
    #[serde(rename = "chapterUid", deserialize_with = "string_or_number")]
    pub chapter_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(rename = "isLock", default)]
    pub locked: bool,
    #[serde(rename = "chapterIdx", default)]
    pub sequence_index: usize,
}

fn default_level() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub book: Book,
    pub state: TaskState,
    /// 已处理到的章节数（下一个待处理章节的下标）。
    pub cursor: usize,
    pub last_error: Option<String>,
}

impl DownloadTask {
    pub fn new(book: Book) -> Self {
        Self {
            book,
            state: TaskState::Queued,
            cursor: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Paused,
    Completed,
    Failed,
    /// 被 stop/cancel 结束，不算失败。
    Stopped,
    /// 首次拉取目录后补齐了 format/language。
    BookUpdated,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadEvent {
    pub status: EventStatus,
    pub chapter_offset: usize,
    pub chapter_total: usize,
    pub book_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<Book>,
}

impl DownloadEvent {
    pub(crate) fn new(
        status: EventStatus,
        book_id: &str,
        chapter_offset: usize,
        chapter_total: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            chapter_offset,
            chapter_total,
            book_id: book_id.to_string(),
            message: message.into(),
            book: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Stopped
        )
    }
}

/// ArchiveStore 统计出的进度。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveProgress {
    pub downloaded: usize,
    pub total: usize,
    pub complete: bool,
}

// ── serde 工具函数 ──────────────────────────────────────────────────

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(v) => v.to_string(),
        Raw::Uint(v) => v.to_string(),
    })
}

fn lenient_format<'de, D>(deserializer: D) -> Result<Option<BookFormat>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.trim().is_empty())
        .map(|s| BookFormat::from_remote(&s)))
}
