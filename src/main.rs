mod bundle;
mod config;
mod core;

use crate::config::Config;
use crate::core::{Release, list_versions, rollback, upload_bundle};
use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use courtside_common::interface::Platform;
use courtside_common::utils::format_size;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ota-release", version, about = "构建并发布 OTA bundle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建并上传新版本
    Release {
        #[arg(long, short)]
        platform: Platform,
        /// 版本号，例如 1.3.0
        #[arg(long)]
        version: String,
        /// 强制更新
        #[arg(long)]
        mandatory: bool,
        #[arg(long, short, default_value = "")]
        description: String,
        /// 最低原生应用版本
        #[arg(long = "min-app", value_name = "SEMVER")]
        min_app: Option<String>,
        /// 上传已构建好的 bundle，跳过构建
        #[arg(long, value_name = "PATH")]
        bundle: Option<PathBuf>,
    },
    /// 列出已发布的版本
    List {
        #[arg(long, short)]
        platform: Platform,
    },
    /// 回滚到指定版本
    Rollback {
        #[arg(long, short)]
        platform: Platform,
        #[arg(long)]
        version: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::from_env()?;

    match cli.command {
        Commands::Release {
            platform,
            version,
            mandatory,
            description,
            min_app,
            bundle,
        } => {
            if version.trim().is_empty() {
                bail!("版本号不能为空");
            }

            let (bundle_path, build) = match bundle {
                Some(path) => {
                    if !path.is_file() {
                        bail!("bundle 文件 '{}' 不存在", path.display());
                    }
                    (path, None)
                }
                None => {
                    println!("🔨 正在构建 {platform} bundle...");
                    let template = bundle::build_command_template();
                    let root = std::env::current_dir()?.join("ota-build");
                    let out = bundle::build_bundle(&template, platform, &root).await?;
                    (out.bundle.clone(), Some(out))
                }
            };

            let size = std::fs::metadata(&bundle_path)?.len();
            println!("📤 正在上传 {} ({})", bundle_path.display(), format_size(size));

            let release = Release {
                platform,
                version,
                mandatory,
                description,
                min_app_version: min_app,
                bundle: bundle_path,
            };
            let resp = upload_bundle(&cfg, &release).await?;
            println!(
                "✅ 发布成功：{} {} ({})",
                resp.platform,
                resp.version,
                format_size(resp.size)
            );
            if let Some(hash) = resp.hash {
                println!("   SHA-256: {hash}");
            }

            if let Some(out) = build {
                out.remove().await;
            }
        }
        Commands::List { platform } => {
            let list = list_versions(&cfg, platform).await?;
            if list.versions.is_empty() {
                println!("ℹ️ {platform} 平台还没有发布任何版本");
                return Ok(());
            }
            println!("📦 {platform} 平台已发布的版本:");
            for entry in list.versions {
                println!(
                    "  {:<12} {:>10}  {}{}",
                    entry.version,
                    format_size(entry.size),
                    entry.uploaded_at.as_deref().unwrap_or("-"),
                    if entry.mandatory { "  [强制]" } else { "" }
                );
            }
        }
        Commands::Rollback { platform, version } => {
            rollback(&cfg, platform, &version).await?;
            println!("✅ 已将 {platform} 回滚到 {version}");
        }
    }

    Ok(())
}
