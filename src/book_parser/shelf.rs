//! 书架：远端书架分页同步与本地书籍列表。
//!
//! 本地列表都是同一种 JSON 数组文件：同步下来的 `book_shelf.json`、
//! 下载过的 `local_book_shelf.json` 与收藏的 `fav_book_shelf.json`。

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::json;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::archive::{ArchiveError, ArchiveStore};
use crate::base_system::retry::{RetryPolicy, with_retry_if};
use crate::download::models::{ArchiveProgress, Book};
use crate::network_parser::page_parser::{PageParseError, parse_shelf_indexes};
use crate::network_parser::transport::{Transport, TransportError, shelf_sync_url};

#[derive(Debug, Error)]
pub enum ShelfError {
    #[error("书架请求失败（第 {page} 页，{attempts} 次）: {source}")]
    Transport {
        page: usize,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("书架页面解析失败: {0}")]
    Page(#[from] PageParseError),
    #[error("书架响应格式不正确: {0}")]
    Response(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] ArchiveError),
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    books: Vec<Book>,
}

/// 读取书架页中的 shelfIndexes（全部书籍 ID，按书架顺序）。
pub fn fetch_shelf_indexes(
    transport: &dyn Transport,
    retry: RetryPolicy,
) -> Result<Vec<String>, ShelfError> {
    let html = with_retry_if(retry, "shelf page", TransportError::is_transient, || {
        transport.fetch_shelf_page()
    })
    .map_err(|e| ShelfError::Transport {
        page: 0,
        attempts: e.attempts,
        source: e.last,
    })?;
    Ok(parse_shelf_indexes(&html)?)
}

/// 按 `page_size` 分页请求书籍详情，共 ceil(n / page_size) 页。
pub fn sync_shelf(
    transport: &dyn Transport,
    indexes: &[String],
    page_size: usize,
    retry: RetryPolicy,
) -> Result<Vec<Book>, ShelfError> {
    let page_size = page_size.max(1);
    let url = shelf_sync_url();
    let mut books = Vec::with_capacity(indexes.len());

    for (page, ids) in indexes.chunks(page_size).enumerate() {
        let payload = json!({
            "bookIds": ids,
            "count": page_size,
            "isArchive": null,
            "currentArchiveId": null,
            "loadMore": true,
        });
        let value = with_retry_if(retry, "shelf sync", TransportError::is_transient, || {
            transport.post_json(&url, &payload)
        })
        .map_err(|e| ShelfError::Transport {
            page: page + 1,
            attempts: e.attempts,
            source: e.last,
        })?;
        let resp: SyncResponse = serde_json::from_value(value)?;
        debug!(target: "shelf", page = page + 1, count = resp.books.len(), "书架分页已获取");
        books.extend(resp.books.into_iter().map(Book::ensure_obfuscated_id));
    }

    info!(target: "shelf", total = books.len(), "书架同步完成");
    Ok(books)
}

/// 拉取远端书架并写入本地书架文件，返回书籍数量。
pub fn sync_into(
    shelf: &mut Shelf,
    transport: &dyn Transport,
    page_size: usize,
    retry: RetryPolicy,
) -> Result<usize, ShelfError> {
    let indexes = fetch_shelf_indexes(transport, retry)?;
    info!(target: "shelf", count = indexes.len(), "书架共 {} 本书", indexes.len());
    let books = sync_shelf(transport, &indexes, page_size, retry)?;
    let total = books.len();
    shelf.replace_with_remote(books);
    shelf.save()?;
    Ok(total)
}

/// 本地书架文件（书籍数组，保持书架顺序）。
#[derive(Debug, Clone)]
pub struct Shelf {
    path: PathBuf,
    books: Vec<Book>,
}

impl Shelf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let books = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => Vec::new(),
            Ok(raw) => serde_json::from_str::<Vec<Book>>(&raw)
                .map_err(|source| ArchiveError::Json {
                    path: path.clone(),
                    source,
                })?
                .into_iter()
                .map(Book::ensure_obfuscated_id)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ArchiveError::Io { path, source }),
        };
        Ok(Self { path, books })
    }

    pub fn save(&self) -> Result<(), ArchiveError> {
        let io_err = |source: io::Error| ArchiveError::Io {
            path: self.path.clone(),
            source,
        };
        let data = serde_json::to_vec_pretty(&self.books).map_err(|source| ArchiveError::Json {
            path: self.path.clone(),
            source,
        })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(&data).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn books(&self) -> &[Book] {
        &self.books
    }

    pub fn get(&self, book_id: &str) -> Option<&Book> {
        self.books.iter().find(|b| b.id == book_id)
    }

    /// 已有记录原位替换，否则追加到末尾。
    pub fn upsert(&mut self, book: Book) {
        match self.books.iter_mut().find(|b| b.id == book.id) {
            Some(slot) => *slot = book,
            None => self.books.push(book),
        }
    }

    /// 仅在不存在时追加，返回是否新增。
    pub fn add(&mut self, book: Book) -> bool {
        if self.get(&book.id).is_some() {
            return false;
        }
        self.books.push(book);
        true
    }

    /// 以远端书架为准重建顺序；本地已探明的 format/language 在远端缺失时保留。
    pub fn replace_with_remote(&mut self, remote: Vec<Book>) {
        let merged = remote
            .into_iter()
            .map(|mut book| {
                if let Some(local) = self.get(&book.id) {
                    if book.format.is_none() {
                        book.format = local.format;
                    }
                    if book.language.is_none() {
                        book.language = local.language.clone();
                    }
                }
                book
            })
            .collect();
        self.books = merged;
    }

    pub fn remove(&mut self, book_id: &str) -> Option<Book> {
        let pos = self.books.iter().position(|b| b.id == book_id)?;
        Some(self.books.remove(pos))
    }

    /// 每本书附带从 ArchiveStore 推导出的进度；读取失败的按未下载处理。
    pub fn annotate_progress(&self, archive: &ArchiveStore) -> Vec<(Book, ArchiveProgress)> {
        self.books
            .iter()
            .map(|book| {
                let progress = archive.compute_progress(&book.id).unwrap_or_else(|err| {
                    warn!(target: "shelf", book_id = %book.id, "读取进度失败: {err}");
                    ArchiveProgress::default()
                });
                (book.clone(), progress)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{BookFormat, ChapterIndexEntry};
    use crate::network_parser::signer::SignedParams;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ShelfTransport {
        bodies: Mutex<Vec<Value>>,
        fail_first: Mutex<usize>,
    }

    impl Transport for ShelfTransport {
        fn fetch_chapter_index(&self, _: &str) -> Result<Vec<ChapterIndexEntry>, TransportError> {
            Ok(Vec::new())
        }

        fn fetch_page_metadata(&self, _: &str) -> Result<String, TransportError> {
            Ok(String::new())
        }

        fn post_signed(&self, _: &str, _: &SignedParams) -> Result<String, TransportError> {
            Ok(String::new())
        }

        fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
            assert!(url.ends_with("/web/shelf/syncBook"));
            let mut fail = self.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(TransportError::new(Some(500), "Internal Server Error"));
            }
            self.bodies.lock().unwrap().push(body.clone());
            let books: Vec<Value> = body["bookIds"]
                .as_array()
                .unwrap()
                .iter()
                .map(|id| json!({"bookId": id, "title": format!("书{}", id.as_str().unwrap()), "author": "某人"}))
                .collect();
            Ok(json!({ "books": books, "synckey": 1 }))
        }

        fn fetch_shelf_page(&self) -> Result<String, TransportError> {
            Ok(r#"<script>window.__INITIAL_STATE__={"shelf":{"shelfIndexes":[{"bookId":"1"},{"bookId":"2"}]}};</script>"#.to_string())
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            wait: Duration::ZERO,
        }
    }

    #[test]
    fn sync_pages_through_all_indexes() {
        let transport = ShelfTransport::default();
        let ids: Vec<String> = (1..=120).map(|i| i.to_string()).collect();

        let books = sync_shelf(&transport, &ids, 50, retry()).unwrap();
        assert_eq!(books.len(), 120);
        assert_eq!(books[119].title, "书120");

        let bodies = transport.bodies.lock().unwrap();
        let sizes: Vec<_> = bodies
            .iter()
            .map(|b| b["bookIds"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(bodies[2]["count"], 50);
        assert_eq!(bodies[0]["loadMore"], true);
        assert!(bodies[0]["isArchive"].is_null());
    }

    #[test]
    fn sync_retries_each_page() {
        let transport = ShelfTransport::default();
        *transport.fail_first.lock().unwrap() = 2;
        let books = sync_shelf(&transport, &["822000".to_string()], 50, retry()).unwrap();
        let mut book = books.into_iter().next().unwrap();
        assert_eq!(book.obfuscated_id(), "c6332d305c8af0c631210b4");

        *transport.fail_first.lock().unwrap() = 4;
        let err = sync_shelf(&transport, &["1".to_string()], 50, retry()).unwrap_err();
        assert!(matches!(
            err,
            ShelfError::Transport {
                page: 1,
                attempts: 4,
                ..
            }
        ));
    }

    #[test]
    fn shelf_indexes_come_from_shelf_page() {
        let ids = fetch_shelf_indexes(&ShelfTransport::default(), retry()).unwrap();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn sync_into_persists_remote_shelf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book_shelf.json");
        let mut shelf = Shelf::load(&path).unwrap();

        let n = sync_into(&mut shelf, &ShelfTransport::default(), 50, retry()).unwrap();
        assert_eq!(n, 2);
        let reloaded = Shelf::load(&path).unwrap();
        assert_eq!(reloaded.get("2").unwrap().title, "书2");
    }

    #[test]
    fn local_shelf_round_trip_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book_shelf.json");

        let mut shelf = Shelf::load(&path).unwrap();
        assert!(shelf.books().is_empty());

        let mut known = Book::new("1", "旧书名");
        known.format = Some(BookFormat::Epub);
        shelf.upsert(known);
        shelf.upsert(Book::new("2", "乙"));
        shelf.save().unwrap();

        let mut reloaded = Shelf::load(&path).unwrap();
        assert_eq!(reloaded.books().len(), 2);

        reloaded.replace_with_remote(vec![Book::new("3", "丙"), Book::new("1", "新书名")]);
        let ids: Vec<_> = reloaded.books().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
        let one = reloaded.get("1").unwrap();
        assert_eq!(one.title, "新书名");
        assert_eq!(one.format, Some(BookFormat::Epub));

        assert!(reloaded.remove("3").is_some());
        assert!(reloaded.remove("3").is_none());
    }

    #[test]
    fn add_keeps_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fav_book_shelf.json");
        fs::write(&path, "").unwrap();

        let mut favs = Shelf::load(&path).unwrap();
        assert!(favs.books().is_empty());
        assert!(favs.add(Book::new("7", "收藏")));
        assert!(!favs.add(Book::new("7", "重复")));
        favs.save().unwrap();

        let reloaded = Shelf::load(&path).unwrap();
        assert_eq!(reloaded.books().len(), 1);
        assert_eq!(reloaded.get("7").unwrap().title, "收藏");
    }

    #[test]
    fn progress_is_annotated_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ArchiveStore::new(dir.path());
        let entries: Vec<ChapterIndexEntry> = (1..=2)
            .map(|i| ChapterIndexEntry {
                chapter_id: i.to_string(),
                title: String::new(),
                level: 1,
                locked: false,
                sequence_index: i,
            })
            .collect();
        archive.write_chapter_index("1", &entries).unwrap();
        archive.write_chapter("1", "1", BookFormat::Txt, "x").unwrap();

        let mut shelf = Shelf::load(dir.path().join("book_shelf.json")).unwrap();
        shelf.upsert(Book::new("1", "甲"));
        shelf.upsert(Book::new("2", "乙"));

        let rows = shelf.annotate_progress(&archive);
        assert_eq!((rows[0].1.downloaded, rows[0].1.total), (1, 2));
        assert_eq!(rows[1].1, ArchiveProgress::default());
    }
}
