//! 本地书库（books/<book_id>/）读写。
//!
//! 目录结构：
//! - `info.json`      书籍快照
//! - `chapters.json`  目录（有序）
//! - `chapters/`      每章一个解码后的文件，文件名为 chapter_id
//!
//! 章节文件是否存在是"已下载"的唯一依据，不另存进度。

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::base_system::context::safe_fs_name;
use crate::download::models::{ArchiveProgress, Book, BookFormat, ChapterIndexEntry};

const BOOKS_DIR: &str = "books";
const INFO_FILE: &str = "info.json";
const INDEX_FILE: &str = "chapters.json";
const CHAPTERS_DIR: &str = "chapters";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid json at {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    /// `base` 为保存根目录，书库位于 `base/books/`。
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            root: base.as_ref().join(BOOKS_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn book_dir(&self, book_id: &str) -> PathBuf {
        self.root.join(safe_fs_name(book_id, "_", 120))
    }

    fn chapters_dir(&self, book_id: &str) -> PathBuf {
        self.book_dir(book_id).join(CHAPTERS_DIR)
    }

    pub fn chapter_path(&self, book_id: &str, chapter_id: &str, format: BookFormat) -> PathBuf {
        let name = format!(
            "{}.{}",
            safe_fs_name(chapter_id, "_", 120),
            format.extension()
        );
        self.chapters_dir(book_id).join(name)
    }

    pub fn has_chapter(&self, book_id: &str, chapter_id: &str, format: BookFormat) -> bool {
        self.chapter_path(book_id, chapter_id, format).is_file()
    }

    /// 先写临时文件再改名，已完成的章节文件不会被写成半截。
    pub fn write_chapter(
        &self,
        book_id: &str,
        chapter_id: &str,
        format: BookFormat,
        content: &str,
    ) -> Result<PathBuf, ArchiveError> {
        let target = self.chapter_path(book_id, chapter_id, format);
        self.write_atomic(book_id, &target, content.as_bytes())?;
        debug!(target: "archive", book_id, chapter_id, bytes = content.len(), "章节已保存");
        Ok(target)
    }

    pub fn write_book_info(&self, book: &Book) -> Result<(), ArchiveError> {
        let path = self.book_dir(&book.id).join(INFO_FILE);
        self.write_json(&book.id, &path, book)
    }

    pub fn read_book_info(&self, book_id: &str) -> Result<Option<Book>, ArchiveError> {
        let path = self.book_dir(book_id).join(INFO_FILE);
        Ok(read_json::<Book>(&path)?.map(Book::ensure_obfuscated_id))
    }

    /// 重新拉取目录时整体覆盖。
    pub fn write_chapter_index(
        &self,
        book_id: &str,
        entries: &[ChapterIndexEntry],
    ) -> Result<(), ArchiveError> {
        let path = self.book_dir(book_id).join(INDEX_FILE);
        self.write_json(book_id, &path, &entries)
    }

    pub fn read_chapter_index(
        &self,
        book_id: &str,
    ) -> Result<Option<Vec<ChapterIndexEntry>>, ArchiveError> {
        read_json(&self.book_dir(book_id).join(INDEX_FILE))
    }

    /// 进度只由章节文件计数与目录长度推导。
    ///
    /// 只统计目录中出现、且扩展名与书籍格式一致的章节文件；
    /// 之前按另一种格式写下的残留文件不计入。
    pub fn compute_progress(&self, book_id: &str) -> Result<ArchiveProgress, ArchiveError> {
        let Some(index) = self.read_chapter_index(book_id)? else {
            return Ok(ArchiveProgress::default());
        };
        let format = self
            .read_book_info(book_id)?
            .map(|b| b.effective_format())
            .unwrap_or(BookFormat::Txt);
        let downloaded = index
            .iter()
            .filter(|e| self.has_chapter(book_id, &e.chapter_id, format))
            .count();
        let total = index.len();
        Ok(ArchiveProgress {
            downloaded,
            total,
            complete: downloaded == total,
        })
    }

    pub fn remove_book(&self, book_id: &str) -> Result<bool, ArchiveError> {
        let dir = self.book_dir(book_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        info!(target: "archive", book_id, "已删除本地书籍目录");
        Ok(true)
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        book_id: &str,
        path: &Path,
        value: &T,
    ) -> Result<(), ArchiveError> {
        let data = serde_json::to_vec_pretty(value).map_err(|source| ArchiveError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        self.write_atomic(book_id, path, &data)
    }

    fn write_atomic(&self, book_id: &str, target: &Path, data: &[u8]) -> Result<(), ArchiveError> {
        let book_dir = self.book_dir(book_id);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        // 临时文件放在书籍目录而不是 chapters/，中途崩溃不会被计入进度
        let mut tmp = NamedTempFile::new_in(&book_dir).map_err(io_err(&book_dir))?;
        tmp.write_all(data).map_err(io_err(target))?;
        tmp.as_file().sync_all().map_err(io_err(target))?;
        tmp.persist(target).map_err(|e| ArchiveError::Io {
            path: target.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ArchiveError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| ArchiveError::Json {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, idx: usize) -> ChapterIndexEntry {
        ChapterIndexEntry {
            chapter_id: id.to_string(),
            title: format!("第{idx}章"),
            level: 1,
            locked: false,
            sequence_index: idx,
        }
    }

    #[test]
    fn chapter_path_uses_format_extension() {
        let store = ArchiveStore::new("/data");
        assert_eq!(
            store.chapter_path("100", "7", BookFormat::Epub),
            PathBuf::from("/data/books/100/chapters/7.xhtml")
        );
        assert_eq!(
            store.chapter_path("100", "7", BookFormat::Txt),
            PathBuf::from("/data/books/100/chapters/7.txt")
        );
    }

    #[test]
    fn progress_counts_files_against_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());

        assert_eq!(store.compute_progress("1").unwrap(), ArchiveProgress::default());

        store
            .write_chapter_index("1", &[entry("a", 1), entry("b", 2), entry("c", 3)])
            .unwrap();
        store.write_chapter("1", "a", BookFormat::Txt, "甲").unwrap();
        store.write_chapter("1", "b", BookFormat::Txt, "乙").unwrap();

        let p = store.compute_progress("1").unwrap();
        assert_eq!((p.downloaded, p.total, p.complete), (2, 3, false));
        assert!(store.has_chapter("1", "a", BookFormat::Txt));
        assert!(!store.has_chapter("1", "a", BookFormat::Epub));

        store.write_chapter("1", "c", BookFormat::Txt, "丙").unwrap();
        assert!(store.compute_progress("1").unwrap().complete);
    }

    #[test]
    fn progress_ignores_files_of_other_format_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        let mut book = Book::new("4", "甲");
        book.format = Some(BookFormat::Epub);
        store.write_book_info(&book).unwrap();
        store
            .write_chapter_index("4", &[entry("a", 1), entry("b", 2)])
            .unwrap();

        // 早先按 txt 写下的残留与目录外的文件
        store.write_chapter("4", "a", BookFormat::Txt, "旧").unwrap();
        store.write_chapter("4", "b", BookFormat::Txt, "旧").unwrap();
        store.write_chapter("4", "z", BookFormat::Epub, "<p/>").unwrap();
        let p = store.compute_progress("4").unwrap();
        assert_eq!((p.downloaded, p.total, p.complete), (0, 2, false));

        store.write_chapter("4", "a", BookFormat::Epub, "<p/>").unwrap();
        assert_eq!(store.compute_progress("4").unwrap().downloaded, 1);
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        store.write_chapter("9", "1", BookFormat::Epub, "<p/>").unwrap();
        store.write_chapter("9", "1", BookFormat::Epub, "<p>v2</p>").unwrap();

        let names: Vec<_> = fs::read_dir(store.book_dir("9"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["chapters".to_string()]);
        let body = fs::read_to_string(store.chapter_path("9", "1", BookFormat::Epub)).unwrap();
        assert_eq!(body, "<p>v2</p>");
    }

    #[test]
    fn book_info_round_trip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        let mut book = Book::new("3300107269", "三体");
        book.format = Some(BookFormat::Epub);
        store.write_book_info(&book).unwrap();

        let loaded = store.read_book_info("3300107269").unwrap().unwrap();
        assert_eq!(loaded, book);

        assert!(store.remove_book("3300107269").unwrap());
        assert!(!store.remove_book("3300107269").unwrap());
        assert!(store.read_book_info("3300107269").unwrap().is_none());
    }

    #[test]
    fn corrupt_index_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::new(dir.path());
        fs::create_dir_all(store.book_dir("2")).unwrap();
        fs::write(store.book_dir("2").join(INDEX_FILE), "not json").unwrap();
        assert!(matches!(
            store.compute_progress("2"),
            Err(ArchiveError::Json { .. })
        ));
    }
}
