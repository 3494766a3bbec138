//! 无 UI 命令行交互入口。
//!
//! 各子命令共用的小工具：书籍 ID 解析、读取一行输入。

use std::io::{self, BufRead, Write};

use anyhow::{Result, bail};

use crate::base_system::book_id::parse_book_id;

mod download;
mod library;

pub use download::run_download;
pub use library::{
    add_favorite, remove_book, remove_favorite, show_favorites, show_local, show_shelf, show_status,
    sync_shelf,
};

/// 把命令行参数（ID 或链接）解析为去重后的书籍 ID 列表。
fn resolve_book_ids(inputs: &[String]) -> Result<Vec<String>> {
    let mut ids: Vec<String> = Vec::with_capacity(inputs.len());
    for raw in inputs {
        let Some(id) = parse_book_id(raw) else {
            bail!("无法识别的书籍 ID 或链接: {raw}");
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn resolve_book_id(input: &str) -> Result<String> {
    match parse_book_id(input) {
        Some(id) => Ok(id),
        None => bail!("无法识别的书籍 ID 或链接: {input}"),
    }
}

fn read_line(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush().ok();
    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(line)
}
