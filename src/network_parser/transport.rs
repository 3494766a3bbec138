//! 传输层接口与基于 reqwest 的实现。
//!
//! 下载流程只依赖 [`Transport`]；登录与 Cookie 由外部完成，
//! 这里的 HTTP 实现只是把配置中的 Cookie 原样带上。

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, REFERER,
    USER_AGENT,
};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::page_parser::parse_chapter_infos;
use super::signer::{SignedParams, obfuscate_id};
use crate::base_system::context::Config;
use crate::download::models::{BookFormat, ChapterIndexEntry};

pub const BASE_URL: &str = "https://weread.qq.com";
const CHAPTER_INFOS_PATH: &str = "/web/book/chapterInfos";
const SHELF_PATH: &str = "/web/shelf";
const SHELF_SYNC_PATH: &str = "/web/shelf/syncBook";

#[derive(Debug, Clone, Error)]
#[error("{}{message}", status_prefix(.status))]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
    /// 为 false 时重试也不会成功（响应格式错误等）
    pub transient: bool,
}

fn status_prefix(status: &Option<u16>) -> String {
    status.map(|code| format!("HTTP {code}: ")).unwrap_or_default()
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            transient: true,
        }
    }

    /// 响应已收到但内容无法解析。
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            transient: true,
        }
    }
}

/// 正文接口地址：epub 为 e_0..e_3，txt 为 t_0..t_1。
pub fn chapter_content_urls(format: BookFormat) -> Vec<String> {
    let prefix = match format {
        BookFormat::Epub => "e",
        BookFormat::Txt => "t",
    };
    (0..format.part_count())
        .map(|i| format!("{BASE_URL}/web/book/chapter/{prefix}_{i}"))
        .collect()
}

pub fn reader_url(obfuscated_book_id: &str) -> String {
    format!("{BASE_URL}/web/reader/{obfuscated_book_id}")
}

pub fn shelf_sync_url() -> String {
    format!("{BASE_URL}{SHELF_SYNC_PATH}")
}

/// 已登录会话提供的网络能力。实现必须可跨线程移动到下载工作线程。
pub trait Transport: Send {
    fn fetch_chapter_index(&self, book_id: &str) -> Result<Vec<ChapterIndexEntry>, TransportError>;

    /// 阅读页 HTML（含 `__INITIAL_STATE__` 与目录锁定信息）。
    fn fetch_page_metadata(&self, book_id: &str) -> Result<String, TransportError>;

    fn post_signed(&self, url: &str, params: &SignedParams) -> Result<String, TransportError>;

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError>;

    /// 书架页 HTML（含 shelfIndexes）。
    fn fetch_shelf_page(&self) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        headers.insert(REFERER, HeaderValue::from_static("https://weread.qq.com/"));
        if !config.cookie.trim().is_empty() {
            let cookie = HeaderValue::from_str(config.cookie.trim())
                .map_err(|e| TransportError::new(None, format!("cookie 含非法字符: {e}")))?;
            headers.insert(COOKIE, cookie);
        }

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout.max(1)));
        if let Some(ms) = ms_from_secs(config.connect_timeout) {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    fn json_post(&self, url: &str) -> RequestBuilder {
        self.client
            .post(url)
            .header(CONTENT_TYPE, "application/json;charset=UTF-8")
            .header(ACCEPT, "application/json, text/plain, */*")
    }

    fn get_text(&self, url: &str) -> Result<String, TransportError> {
        let resp = self
            .client
            .get(url)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()?;
        read_text(resp)
    }
}

impl Transport for HttpTransport {
    fn fetch_chapter_index(&self, book_id: &str) -> Result<Vec<ChapterIndexEntry>, TransportError> {
        let url = format!("{BASE_URL}{CHAPTER_INFOS_PATH}");
        let body = json!({ "bookIds": [book_id] });
        let value = self.post_json(&url, &body)?;
        parse_chapter_infos(&value).map_err(|e| TransportError::malformed(e.to_string()))
    }

    fn fetch_page_metadata(&self, book_id: &str) -> Result<String, TransportError> {
        self.get_text(&reader_url(&obfuscate_id(book_id)))
    }

    fn post_signed(&self, url: &str, params: &SignedParams) -> Result<String, TransportError> {
        debug!(target: "transport", url, "post signed");
        let resp = self.json_post(url).json(params).send()?;
        read_text(resp)
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        let resp = self.json_post(url).json(body).send()?;
        let text = read_text(resp)?;
        serde_json::from_str(&text)
            .map_err(|e| TransportError::malformed(format!("响应不是合法 JSON: {e}")))
    }

    fn fetch_shelf_page(&self) -> Result<String, TransportError> {
        self.get_text(&format!("{BASE_URL}{SHELF_PATH}"))
    }
}

fn read_text(resp: reqwest::blocking::Response) -> Result<String, TransportError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::new(
            Some(status.as_u16()),
            status.canonical_reason().unwrap_or("request failed"),
        ));
    }
    Ok(resp.text()?)
}

fn ms_from_secs(v: f64) -> Option<u64> {
    if v <= 0.0 {
        return None;
    }
    let ms = (v * 1000.0).round() as i64;
    if ms <= 0 { None } else { Some(ms as u64) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_urls_per_format() {
        assert_eq!(
            chapter_content_urls(BookFormat::Txt),
            vec![
                "https://weread.qq.com/web/book/chapter/t_0",
                "https://weread.qq.com/web/book/chapter/t_1"
            ]
        );
        let epub = chapter_content_urls(BookFormat::Epub);
        assert_eq!(epub.len(), 4);
        assert!(epub[2].ends_with("/e_2"));
    }

    #[test]
    fn transport_error_display_includes_status() {
        assert_eq!(
            TransportError::new(Some(403), "Forbidden").to_string(),
            "HTTP 403: Forbidden"
        );
        assert_eq!(TransportError::new(None, "timeout").to_string(), "timeout");
    }

    #[test]
    fn malformed_responses_are_not_transient() {
        let err = TransportError::malformed("缺少字段: data[0].updated");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "缺少字段: data[0].updated");
        assert!(TransportError::new(Some(502), "Bad Gateway").is_transient());
    }

    #[test]
    fn client_errors_convert_without_status() {
        let err = Client::new().get("not a url").send().unwrap_err();
        let converted = TransportError::from(err);
        assert_eq!(converted.status, None);
        assert!(converted.is_transient());
        assert!(!converted.message.is_empty());
    }

    #[test]
    fn connect_timeout_conversion() {
        assert_eq!(ms_from_secs(3.05), Some(3050));
        assert_eq!(ms_from_secs(0.0), None);
    }
}
