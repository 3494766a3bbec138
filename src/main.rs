//! WeRead Downloader（微信读书下载器）Rust 实现。
//!
//! 本 crate 负责：配置加载、书架同步、请求签名、章节解扰与断点续传式下载。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/重试/书籍 ID 等基础设施
//! - `network_parser`：请求签名、传输层与页面解析
//! - `book_parser`：章节解扰、本地书库与书架
//! - `download`：数据模型与下载调度
//! - `ui`：命令行交互

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;

mod base_system;
mod book_parser;
mod download;
mod network_parser;
mod ui;

use base_system::config::load_or_create;
use base_system::context::Config;
use base_system::logging::{LogOptions, LogSystem};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "weread-downloader")]
#[command(about = "WeRead book downloader (CLI)")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,

    /// 数据目录路径（用于存放 config.yml 和 logs 等文件）
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 下载一本或多本书（书籍 ID 或链接），运行中可输入 p/r/s/q 控制
    Download {
        #[arg(required = true)]
        books: Vec<String>,
    },
    /// 列出本地书架及下载进度
    Shelf,
    /// 从远端同步书架到本地
    Sync,
    /// 列出下载过的书及进度
    Local,
    /// 本地收藏
    Fav {
        #[command(subcommand)]
        action: Option<FavAction>,
    },
    /// 查看某本书的本地下载进度
    Status { book: String },
    /// 删除某本书的本地文件与书架记录
    Remove {
        book: String,
        /// 不再确认
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// 打印 ID 的混淆形式
    Hash { raw: String },
}

#[derive(Debug, Subcommand)]
enum FavAction {
    /// 列出收藏（默认）
    List,
    /// 收藏一本书
    Add { book: String },
    /// 取消收藏
    Remove { book: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("WeRead Downloader v{}", VERSION);
        return Ok(());
    }

    let Some(command) = cli.command else {
        println!("WeRead Downloader v{}，使用 --help 查看可用命令", VERSION);
        return Ok(());
    };

    // 纯计算，不需要配置与日志
    if let Command::Hash { raw } = &command {
        println!("{}", network_parser::signer::obfuscate_id(raw));
        return Ok(());
    }

    let base_dir = match cli.data_dir.as_deref() {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().map_err(|e| anyhow!("无法获取当前目录: {e}"))?,
    };
    let log = init_logging(cli.debug, &base_dir)?;
    let mut config =
        load_or_create::<Config>(Some(base_dir.as_path())).map_err(|e| anyhow!(e.to_string()))?;
    if config.save_path.trim().is_empty() {
        config.save_path = base_dir.to_string_lossy().into_owned();
    }
    info!(target: "startup", "当前版本: v{}", VERSION);

    let result = match command {
        Command::Download { books } => ui::noui::run_download(&config, &log, &books),
        Command::Shelf => ui::noui::show_shelf(&config),
        Command::Sync => ui::noui::sync_shelf(&config),
        Command::Local => ui::noui::show_local(&config),
        Command::Fav { action } => match action.unwrap_or(FavAction::List) {
            FavAction::List => ui::noui::show_favorites(&config),
            FavAction::Add { book } => ui::noui::add_favorite(&config, &book),
            FavAction::Remove { book } => ui::noui::remove_favorite(&config, &book),
        },
        Command::Status { book } => ui::noui::show_status(&config, &book),
        Command::Remove { book, yes } => ui::noui::remove_book(&config, &book, yes),
        Command::Hash { .. } => Ok(()),
    };

    if let Err(err) = &result {
        tracing::error!(target: "startup", "{err:#}");
    }
    log.safe_exit();
    result
}

fn init_logging(debug: bool, base_dir: &Path) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init(base_dir, opts).map_err(|e| anyhow!(e))
}
