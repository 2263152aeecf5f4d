use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Courtside 录制分块上传与 OTA 更新客户端", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// 打印详细输出
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// 指定配置文件路径
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "重置配置文件")]
    Config,
    #[command(about = "按顺序上传录制分块，最后一个文件视为最终分块")]
    Upload {
        /// 比赛 ID
        #[arg(long, short = 'm')]
        match_id: String,

        /// 分块文件，按给定顺序编号
        #[arg(required = true)]
        files: Vec<String>,
    },
    #[command(subcommand, about = "OTA 更新")]
    Ota(OtaCommand),
}

#[derive(Subcommand, Debug)]
pub enum OtaCommand {
    #[command(about = "检查是否有新版本")]
    Check,
    #[command(about = "检查并下载更新")]
    Sync {
        /// 自动同意所有提示
        #[arg(long, short = 'y')]
        yes: bool,

        /// 不提示，直接下载
        #[arg(long)]
        no_prompt: bool,
    },
    #[command(about = "查看当前 OTA 状态")]
    Status,
    #[command(about = "回滚到内置 bundle")]
    Rollback,
    #[command(about = "删除当前版本以外的缓存")]
    Cleanup,
}

pub fn get_cli_args() -> Cli {
    Cli::parse()
}
