use clap::Parser;
use std::path::PathBuf;

/// 媒体下载器
#[derive(Parser, Debug)]
#[command(name = "mdl")]
#[command(version)]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "支持排队、暂停续传和失败重试的媒体下载工具", long_about = None)]
pub struct Cli {
    /// 媒体直链，可以给多个
    #[arg(value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub urls: Vec<String>,

    /// 文件保存目录
    #[arg(long, value_name = "DIR")]
    #[arg(default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: PathBuf,

    /// 最大并发数 (1-10)，覆盖配置文件
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// 任务状态文件
    #[arg(long, value_name = "FILE")]
    #[arg(default_value = "state.json")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub state_file: PathBuf,

    /// 配置文件 (JSON)
    #[arg(long, value_name = "FILE")]
    #[arg(default_value = "mdl.json")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// 继续上次暂停的任务
    #[arg(long)]
    pub resume: bool,

    /// 重试上次失败的任务
    #[arg(long)]
    pub retry_failed: bool,

    /// 只列出已有任务，不下载
    #[arg(long)]
    pub list: bool,
}
