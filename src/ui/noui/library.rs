//! 书架相关子命令：列出、同步、查看进度、删除，以及本地收藏与已下载列表。

use anyhow::{Context, Result};
use tracing::info;

use super::{read_line, resolve_book_id};
use crate::base_system::context::Config;
use crate::base_system::retry::RetryPolicy;
use crate::book_parser::archive::ArchiveStore;
use crate::book_parser::shelf::{Shelf, sync_into};
use crate::download::models::{ArchiveProgress, Book};
use crate::network_parser::transport::HttpTransport;

fn progress_label(p: &ArchiveProgress) -> String {
    if p.total == 0 {
        "未下载".to_string()
    } else if p.complete {
        format!("已完成 {}/{}", p.downloaded, p.total)
    } else {
        format!("{}/{}", p.downloaded, p.total)
    }
}

fn book_line(idx: usize, book: &Book, p: &ArchiveProgress) -> String {
    let format = book
        .format
        .map(|f| f.extension().to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:>3}. {} | ID: {} | 作者: {} | 格式: {} | {}",
        idx + 1,
        book.display_name(),
        book.id,
        book.author,
        format,
        progress_label(p)
    )
}

fn print_books(config: &Config, name: &str, list: &Shelf, empty_hint: &str) {
    if list.books().is_empty() {
        println!("{empty_hint}");
        return;
    }
    let archive = ArchiveStore::new(config.default_save_dir());
    println!("===== {}（{} 本）=====", name, list.books().len());
    for (idx, (book, progress)) in list.annotate_progress(&archive).iter().enumerate() {
        println!("{}", book_line(idx, book, progress));
    }
}

pub fn show_shelf(config: &Config) -> Result<()> {
    let shelf = Shelf::load(config.shelf_path()).context("读取本地书架失败")?;
    print_books(config, "书架", &shelf, "本地书架为空，可先执行 sync 同步书架");
    Ok(())
}

pub fn show_local(config: &Config) -> Result<()> {
    let local = Shelf::load(config.local_path()).context("读取已下载列表失败")?;
    print_books(config, "已下载", &local, "还没有下载过的书");
    Ok(())
}

pub fn show_favorites(config: &Config) -> Result<()> {
    let favs = Shelf::load(config.fav_path()).context("读取收藏失败")?;
    print_books(config, "收藏", &favs, "收藏为空，可用 fav add <书籍ID> 添加");
    Ok(())
}

/// 书籍信息依次取自书架、本地书库，都没有时只记 ID。
fn known_book(config: &Config, book_id: &str) -> Result<Book> {
    if let Some(book) = Shelf::load(config.shelf_path())?.get(book_id) {
        return Ok(book.clone());
    }
    let archive = ArchiveStore::new(config.default_save_dir());
    Ok(archive
        .read_book_info(book_id)?
        .unwrap_or_else(|| Book::new(book_id, "")))
}

pub fn add_favorite(config: &Config, input: &str) -> Result<()> {
    let book_id = resolve_book_id(input)?;
    let mut favs = Shelf::load(config.fav_path()).context("读取收藏失败")?;
    let book = known_book(config, &book_id)?;
    let name = book.display_name().to_string();
    if !favs.add(book) {
        println!("《{}》已经收藏过", name);
        return Ok(());
    }
    favs.save().context("保存收藏失败")?;
    info!(target: "shelf", book_id = %book_id, "已收藏");
    println!("已收藏《{}》", name);
    Ok(())
}

pub fn remove_favorite(config: &Config, input: &str) -> Result<()> {
    let book_id = resolve_book_id(input)?;
    let mut favs = Shelf::load(config.fav_path()).context("读取收藏失败")?;
    match favs.remove(&book_id) {
        Some(book) => {
            favs.save().context("保存收藏失败")?;
            println!("已取消收藏《{}》", book.display_name());
        }
        None => println!("收藏中没有 {}", book_id),
    }
    Ok(())
}

pub fn sync_shelf(config: &Config) -> Result<()> {
    let transport = HttpTransport::new(config).context("初始化 HTTP 客户端失败")?;
    let mut shelf = Shelf::load(config.shelf_path()).context("读取本地书架失败")?;
    let total = sync_into(
        &mut shelf,
        &transport,
        config.shelf_page_size,
        RetryPolicy::from_config(config),
    )
    .context("同步书架失败")?;
    println!("已同步 {} 本书到 {}", total, shelf.path().display());
    Ok(())
}

pub fn show_status(config: &Config, input: &str) -> Result<()> {
    let book_id = resolve_book_id(input)?;
    let archive = ArchiveStore::new(config.default_save_dir());
    let progress = archive
        .compute_progress(&book_id)
        .with_context(|| format!("读取进度失败: book_id={book_id}"))?;
    let book = match archive.read_book_info(&book_id)? {
        Some(book) => book,
        None => Shelf::load(config.shelf_path())?
            .get(&book_id)
            .cloned()
            .unwrap_or_else(|| Book::new(book_id.as_str(), "")),
    };

    println!("书名: {}", book.display_name());
    if !book.author.is_empty() {
        println!("作者: {}", book.author);
    }
    if let Some(lang) = book.language.as_deref() {
        println!("语言: {}", lang);
    }
    println!("目录: {}", archive.book_dir(&book_id).display());
    println!("进度: {}", progress_label(&progress));
    Ok(())
}

pub fn remove_book(config: &Config, input: &str, assume_yes: bool) -> Result<()> {
    let book_id = resolve_book_id(input)?;
    if !assume_yes {
        let answer = read_line(&format!("确认删除 {book_id} 的本地文件与书架记录？(y/N)："))?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("已取消");
            return Ok(());
        }
    }

    let archive = ArchiveStore::new(config.default_save_dir());
    let removed_files = archive.remove_book(&book_id)?;
    let mut shelf = Shelf::load(config.shelf_path()).context("读取本地书架失败")?;
    let removed_entry = shelf.remove(&book_id).is_some();
    if removed_entry {
        shelf.save().context("保存书架失败")?;
    }
    let mut local = Shelf::load(config.local_path()).context("读取已下载列表失败")?;
    if local.remove(&book_id).is_some() {
        local.save().context("保存已下载列表失败")?;
    }

    info!(target: "shelf", book_id = %book_id, removed_files, removed_entry, "删除书籍");
    if removed_files || removed_entry {
        println!("已删除 {}", book_id);
    } else {
        println!("本地没有 {} 的记录", book_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_reflect_progress() {
        assert_eq!(progress_label(&ArchiveProgress::default()), "未下载");
        let partial = ArchiveProgress {
            downloaded: 3,
            total: 10,
            complete: false,
        };
        assert_eq!(progress_label(&partial), "3/10");
        let done = ArchiveProgress {
            downloaded: 10,
            total: 10,
            complete: true,
        };
        assert_eq!(progress_label(&done), "已完成 10/10");
    }

    #[test]
    fn remove_clears_archive_and_shelf() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            save_path: dir.path().to_string_lossy().into_owned(),
            ..Config::default()
        };
        let archive = ArchiveStore::new(config.default_save_dir());
        archive.write_book_info(&Book::new("42", "书")).unwrap();
        let mut shelf = Shelf::load(config.shelf_path()).unwrap();
        shelf.upsert(Book::new("42", "书"));
        shelf.save().unwrap();

        let mut local = Shelf::load(config.local_path()).unwrap();
        local.upsert(Book::new("42", "书"));
        local.save().unwrap();

        remove_book(&config, "42", true).unwrap();
        assert!(!archive.book_dir("42").exists());
        assert!(Shelf::load(config.shelf_path()).unwrap().get("42").is_none());
        assert!(Shelf::load(config.local_path()).unwrap().get("42").is_none());
    }

    #[test]
    fn favorites_use_known_book_info() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            save_path: dir.path().to_string_lossy().into_owned(),
            ..Config::default()
        };
        let mut shelf = Shelf::load(config.shelf_path()).unwrap();
        shelf.upsert(Book::new("3300107269", "三体"));
        shelf.save().unwrap();

        add_favorite(&config, "https://weread.qq.com/web/bookDetail?bookId=3300107269").unwrap();
        add_favorite(&config, "3300107269").unwrap();
        add_favorite(&config, "822000").unwrap();

        let favs = Shelf::load(config.fav_path()).unwrap();
        let ids: Vec<_> = favs.books().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["3300107269", "822000"]);
        assert_eq!(favs.get("3300107269").unwrap().title, "三体");

        remove_favorite(&config, "822000").unwrap();
        assert!(Shelf::load(config.fav_path()).unwrap().get("822000").is_none());
        assert!(add_favorite(&config, "不是ID").is_err());
    }
}
