//! 阅读页 / 书架页 HTML 与目录接口 JSON 的解析。

use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use thiserror::Error;

use crate::download::models::{BookFormat, ChapterIndexEntry};

static RE_STATE: OnceLock<Regex> = OnceLock::new();
static SEL_SCRIPT: OnceLock<Selector> = OnceLock::new();
static SEL_LOCK: OnceLock<Selector> = OnceLock::new();

const CATALOG_LEVEL_CLASS: &str = "readerCatalog_list_item_level_";
const CATALOG_DISABLED_CLASS: &str = "readerCatalog_list_item_disabled";

fn re_state() -> &'static Regex {
    RE_STATE.get_or_init(|| {
        Regex::new(r"(?s)window\.__INITIAL_STATE__=(\{.*\});").expect("compile RE_STATE")
    })
}

fn sel_script() -> &'static Selector {
    SEL_SCRIPT.get_or_init(|| Selector::parse("script").expect("compile SEL_SCRIPT"))
}

fn sel_lock() -> &'static Selector {
    SEL_LOCK.get_or_init(|| {
        Selector::parse(".readerCatalog_list_item_lock").expect("compile SEL_LOCK")
    })
}

#[derive(Debug, Error)]
pub enum PageParseError {
    #[error("页面中未找到 __INITIAL_STATE__")]
    MissingState,
    #[error("__INITIAL_STATE__ 不是合法 JSON: {0}")]
    InvalidState(#[from] serde_json::Error),
    #[error("缺少字段: {0}")]
    MissingField(&'static str),
    #[error("无效的目录选择器: {0}")]
    Selector(String),
}

/// 阅读页 `__INITIAL_STATE__` 中下载需要的部分。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageState {
    /// 会话令牌 A（psvts），签名参数 `ps`
    pub psvts: String,
    pub format: Option<BookFormat>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub cover: Option<String>,
}

/// 提取 `<script>` 中 `window.__INITIAL_STATE__={...};` 的 JSON。
pub fn extract_initial_state(html: &str) -> Result<Value, PageParseError> {
    let document = Html::parse_document(html);
    for script in document.select(sel_script()) {
        let text: String = script.text().collect();
        if !text.contains("window.__INITIAL_STATE__") {
            continue;
        }
        let caps = re_state()
            .captures(&text)
            .ok_or(PageParseError::MissingState)?;
        return Ok(serde_json::from_str(&caps[1])?);
    }
    Err(PageParseError::MissingState)
}

pub fn parse_page_state(html: &str) -> Result<PageState, PageParseError> {
    let state = extract_initial_state(html)?;
    let reader = state
        .get("reader")
        .ok_or(PageParseError::MissingField("reader"))?;
    let psvts = reader
        .get("psvts")
        .and_then(value_as_string)
        .filter(|s| !s.is_empty())
        .ok_or(PageParseError::MissingField("reader.psvts"))?;

    let info = reader.get("bookInfo");
    let field = |key: &str| info.and_then(|i| i.get(key)).and_then(value_as_string);

    Ok(PageState {
        psvts,
        format: field("format")
            .filter(|s| !s.is_empty())
            .map(|s| BookFormat::from_remote(&s)),
        language: field("language").filter(|s| !s.is_empty()),
        title: field("title"),
        author: field("author"),
        cover: field("cover"),
    })
}

/// 阅读页目录中各条目的锁定状态，按出现顺序返回。
///
/// `levels` 为空时只取一级目录。
pub fn parse_catalog_locks(html: &str, levels: &[u32]) -> Result<Vec<bool>, PageParseError> {
    let css = if levels.is_empty() {
        format!(".{CATALOG_LEVEL_CLASS}1")
    } else {
        levels
            .iter()
            .map(|l| format!(".{CATALOG_LEVEL_CLASS}{l}"))
            .collect::<Vec<_>>()
            .join(",")
    };
    let selector = Selector::parse(&css).map_err(|e| PageParseError::Selector(e.to_string()))?;

    let document = Html::parse_document(html);
    Ok(document.select(&selector).map(|li| is_locked(&li)).collect())
}

fn is_locked(item: &ElementRef<'_>) -> bool {
    item.value().classes().any(|c| c == CATALOG_DISABLED_CLASS)
        || item.select(sel_lock()).next().is_some()
}

/// 目录接口响应：`data[0].updated[]`。
pub fn parse_chapter_infos(value: &Value) -> Result<Vec<ChapterIndexEntry>, PageParseError> {
    let updated = value
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("updated"))
        .cloned()
        .ok_or(PageParseError::MissingField("data[0].updated"))?;
    Ok(serde_json::from_value(updated)?)
}

/// 书架页 `__INITIAL_STATE__.shelf.shelfIndexes[].bookId`。
pub fn parse_shelf_indexes(html: &str) -> Result<Vec<String>, PageParseError> {
    let state = extract_initial_state(html)?;
    let indexes = state
        .get("shelf")
        .and_then(|s| s.get("shelfIndexes"))
        .and_then(|v| v.as_array())
        .ok_or(PageParseError::MissingField("shelf.shelfIndexes"))?;
    Ok(indexes
        .iter()
        .filter_map(|item| item.get("bookId").and_then(value_as_string))
        .collect())
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
