mod args;
mod ui;

use anyhow::{Result, bail};
use args::{Command, OtaCommand};
use courtside::config::{self, Config};
use courtside::logging::init_logging;
use courtside::ota::{
    AutoPrompter, OtaClient, ProcessHost, Prompter, RestartChoice, StdinPrompter, SyncOptions,
    SyncOutcome, SyncStatus,
};
use courtside::upload::{
    ChannelRecorder, ChunkReady, ChunkUploadQueue, HttpChunkTransport, MAX_RETRIES, PROGRESS_DONE,
    PROGRESS_FAILED,
};
use courtside_common::utils::format_size;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use ui::{ChunkBar, DownloadBar, Spinner};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = args::get_cli_args();

    let path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };

    match cli.command {
        Command::Config => {
            config::write_default_config(&path)?;
            println!("✅ 已重置配置文件 '{}'", path.display());
            Ok(())
        }
        Command::Upload { match_id, files } => {
            let Some((cfg, _guard)) = prepare(&path, cli.verbose)? else {
                return Ok(());
            };
            upload(&cfg, &match_id, files).await
        }
        Command::Ota(cmd) => {
            let Some((cfg, _guard)) = prepare(&path, cli.verbose)? else {
                return Ok(());
            };
            ota(&cfg, cmd).await
        }
    }
}

/// 加载配置并初始化日志；首次运行只生成默认配置
fn prepare(path: &Path, verbose: bool) -> Result<Option<(Config, Option<WorkerGuard>)>> {
    let Some(cfg) = config::load_or_create_config(path)? else {
        println!(
            "已生成默认配置文件 '{}', 请根据实际情况修改配置信息",
            path.display()
        );
        return Ok(None);
    };
    let guard = init_logging(verbose, cfg.log_file.as_deref())?;
    Ok(Some((cfg, guard)))
}

async fn upload(cfg: &Config, match_id: &str, files: Vec<String>) -> Result<()> {
    let total = files.len() as u64;
    let transport = HttpChunkTransport::new(cfg.upload_base_url(), cfg.upload_timeout())?;

    // 所有事件在停止前已投递，只需等待队列排空
    let mut queue_config = cfg.queue_config();
    queue_config.stop_grace = Duration::from_millis(200);
    let attempts = (MAX_RETRIES + 1).saturating_mul(files.len() as u32);
    queue_config.drain_timeout = cfg
        .upload_timeout()
        .saturating_add(queue_config.retry_backoff.saturating_mul(1 << MAX_RETRIES))
        .saturating_mul(attempts);

    let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), queue_config);

    let bar = Arc::new(ChunkBar::new(total)?);
    let observer_bar = Arc::clone(&bar);
    let subscription = queue.on_progress(move |progress| {
        let done = progress.values().filter(|v| **v == PROGRESS_DONE).count() as u64;
        let failed = progress.values().filter(|v| **v == PROGRESS_FAILED).count() as u64;
        observer_bar.update(done, failed);
    });

    queue.start_session(match_id).await?;
    for (index, path) in files.into_iter().enumerate() {
        let chunk_index = index as u64;
        queue.recorder().emit(ChunkReady {
            path,
            chunk_index,
            is_final: chunk_index + 1 == total,
        });
    }
    let report = queue.stop_session().await;
    subscription.unsubscribe();
    bar.finish();

    let failed: Vec<u64> = report
        .progress
        .iter()
        .filter(|(_, v)| **v == PROGRESS_FAILED)
        .map(|(idx, _)| *idx)
        .collect();

    if !report.drained {
        bail!("❌ 上传未完成，仍有 {} 个分块在排队", report.pending);
    }
    if !failed.is_empty() {
        bail!("❌ 以下分块上传失败: {:?}", failed);
    }
    println!("✅ 比赛 {match_id} 的 {total} 个分块全部上传完成");
    Ok(())
}

async fn ota(cfg: &Config, cmd: OtaCommand) -> Result<()> {
    let host = ProcessHost::new(cfg.platform, cfg.mirror_path());
    let client = OtaClient::new(cfg.ota_config(), host).await?;
    if let Err(e) = client.reconcile_native_mirror().await {
        warn!("同步原生侧版本记录失败: {e:#}");
    }

    match cmd {
        OtaCommand::Check => {
            let sp = Spinner::new("正在检查更新...");
            let info = client.check_for_update().await;
            if !info.update_available {
                sp.finish(&format!(
                    "✅ 已是最新版本 ({})",
                    client.get_current_bundle_version().await
                ));
                return Ok(());
            }
            sp.finish(&format!(
                "📦 发现新版本 {}{}",
                info.version.as_deref().unwrap_or("?"),
                if info.mandatory { " (强制更新)" } else { "" }
            ));
            if let Some(size) = info.size {
                println!("   大小: {}", format_size(size));
            }
            if let Some(desc) = info.description.as_deref() {
                println!("   说明: {desc}");
            }
        }
        OtaCommand::Sync { yes, no_prompt } => {
            let outcome = if yes {
                let prompter = AutoPrompter {
                    accept: true,
                    restart: RestartChoice::Now,
                };
                sync(&client, !no_prompt, &prompter).await
            } else {
                sync(&client, !no_prompt, &StdinPrompter).await
            };
            match outcome {
                SyncOutcome::UpToDate => println!("✅ 已是最新版本"),
                SyncOutcome::Declined => println!("ℹ️ 已忽略本次更新"),
                SyncOutcome::Installed { version, restarted } => {
                    println!("✅ 已安装版本 {version}");
                    if !restarted {
                        println!("   将在下次启动时生效");
                    }
                }
                SyncOutcome::Failed => bail!("❌ 更新失败，详情见日志"),
            }
        }
        OtaCommand::Status => {
            let status = client.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OtaCommand::Rollback => {
            client.rollback().await?;
            println!("✅ 已回滚到内置 bundle");
        }
        OtaCommand::Cleanup => {
            let removed = client.cleanup().await?;
            if removed.is_empty() {
                println!("✅ 没有需要清理的旧版本");
            } else {
                println!("✅ 已删除旧版本: {}", removed.join(", "));
            }
        }
    }
    Ok(())
}

async fn sync<P: Prompter>(
    client: &OtaClient<ProcessHost>,
    show_prompt: bool,
    prompter: &P,
) -> SyncOutcome {
    let bar: Arc<OnceLock<DownloadBar>> = Arc::new(OnceLock::new());
    let progress_bar = Arc::clone(&bar);
    let status_bar = Arc::clone(&bar);

    let options = SyncOptions {
        show_prompt,
        on_status_change: Some(Box::new(move |status: SyncStatus| {
            info!(?status, "同步状态");
            if matches!(status, SyncStatus::UpdateInstalled | SyncStatus::Error) {
                if let Some(bar) = status_bar.get() {
                    bar.finish();
                }
            }
        })),
        on_progress: Some(Box::new(move |fraction: f64| {
            progress_bar
                .get_or_init(|| DownloadBar::new("下载更新包"))
                .set_fraction(fraction);
        })),
    };

    client.sync(options, prompter).await
}
