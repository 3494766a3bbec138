//! 单个下载任务的失败原因。

use thiserror::Error;

use crate::book_parser::archive::ArchiveError;
use crate::book_parser::descrambler::DecodeError;
use crate::network_parser::transport::TransportError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("获取目录失败: {0}")]
    IndexFetch(String),
    #[error("第 {index} 章无权限阅读 (chapter_id={chapter_id})")]
    AccessDenied { index: usize, chapter_id: String },
    #[error("请求 {attempts} 次后仍失败: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("下载已停止")]
    Canceled,
}
