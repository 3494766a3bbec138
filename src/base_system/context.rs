//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default)]
    pub save_path: String,
    #[serde(default = "default_shelf_file")]
    pub shelf_file: String,
    #[serde(default = "default_local_file")]
    pub local_file: String,
    #[serde(default = "default_fav_file")]
    pub fav_file: String,

    // 会话配置
    #[serde(default)]
    pub cookie: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 网络配置
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    // 下载节奏
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,
    #[serde(default = "default_pause_tick_ms")]
    pub pause_tick_ms: u64,

    // 书架
    #[serde(default = "default_shelf_page_size")]
    pub shelf_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            shelf_file: default_shelf_file(),
            local_file: default_local_file(),
            fav_file: default_fav_file(),
            cookie: String::new(),
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_wait_ms: default_retry_wait_ms(),
            download_delay_ms: default_download_delay_ms(),
            pause_tick_ms: default_pause_tick_ms(),
            shelf_page_size: default_shelf_page_size(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 13] = [
            FieldMeta {
                name: "save_path",
                description: "保存路径（books/ 目录位于其下，留空为当前目录）",
            },
            FieldMeta {
                name: "shelf_file",
                description: "本地书架文件名（相对保存路径）",
            },
            FieldMeta {
                name: "local_file",
                description: "已下载书籍列表文件名（相对保存路径）",
            },
            FieldMeta {
                name: "fav_file",
                description: "本地收藏文件名（相对保存路径）",
            },
            FieldMeta {
                name: "cookie",
                description: "已登录会话的 Cookie（从浏览器复制）",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求超时时间（秒）；网络请求卡住会阻塞整个下载队列，请勿设置过大",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "max_retries",
                description: "单个请求失败后的最大重试次数",
            },
            FieldMeta {
                name: "retry_wait_ms",
                description: "重试间隔, 单位ms",
            },
            FieldMeta {
                name: "download_delay_ms",
                description: "章节之间的固定间隔, 单位ms",
            },
            FieldMeta {
                name: "pause_tick_ms",
                description: "暂停期间上报进度的间隔, 单位ms",
            },
            FieldMeta {
                name: "shelf_page_size",
                description: "同步书架时每页请求的书籍数",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation("max_retries 不能为 0".to_string()));
        }
        if self.shelf_page_size == 0 {
            return Err(ConfigError::Validation(
                "shelf_page_size 不能为 0".to_string(),
            ));
        }
        if self.pause_tick_ms == 0 {
            return Err(ConfigError::Validation("pause_tick_ms 不能为 0".to_string()));
        }
        Ok(())
    }
}

impl Config {
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn shelf_path(&self) -> PathBuf {
        self.default_save_dir().join(&self.shelf_file)
    }

    pub fn local_path(&self) -> PathBuf {
        self.default_save_dir().join(&self.local_file)
    }

    pub fn fav_path(&self) -> PathBuf {
        self.default_save_dir().join(&self.fav_file)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn download_delay(&self) -> Duration {
        Duration::from_millis(self.download_delay_ms)
    }

    pub fn pause_tick(&self) -> Duration {
        Duration::from_millis(self.pause_tick_ms.max(1))
    }
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => {
                replacement.chars().next().unwrap_or('_')
            }
            c if (c as u32) < 32 => replacement.chars().next().unwrap_or('_'),
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}

fn default_shelf_file() -> String {
    "book_shelf.json".to_string()
}

fn default_local_file() -> String {
    "local_book_shelf.json".to_string()
}

fn default_fav_file() -> String {
    "fav_book_shelf.json".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> f64 {
    3.05
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_wait_ms() -> u64 {
    500
}

fn default_download_delay_ms() -> u64 {
    100
}

fn default_pause_tick_ms() -> u64 {
    1000
}

fn default_shelf_page_size() -> usize {
    50
}
