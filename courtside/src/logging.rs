use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// 初始化日志。
///
/// `RUST_LOG` 优先；否则 verbose 时为 debug，默认 info。指定了日志文件时同时写入文件，
/// 返回的 guard 需要在 main 结束前保持存活。
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("courtside={default_level},warn")));

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("初始化日志失败: {e}"))?;
        return Ok(None);
    };

    // 每次运行覆盖旧日志
    let file = std::fs::File::create(log_file)
        .with_context(|| format!("创建日志文件 '{}' 失败", log_file.display()))?;
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr.and(non_blocking_writer))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("初始化日志失败: {e}"))?;

    Ok(Some(guard))
}
