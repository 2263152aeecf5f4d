use anyhow::{Context, Result};
use courtside_common::interface::{Platform, UpdateInfo};
use std::future::Future;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

/// 宿主运行时：提供应用信息、原生侧持久化与重启能力
pub trait HostRuntime: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    /// 原生应用版本（商店版本）
    fn app_version(&self) -> String;

    fn device_id(&self) -> String;

    /// 将当前 bundle 版本同步到原生侧存储，`None` 表示清除
    fn mirror_bundle_version(&self, version: Option<&str>) -> Result<()>;

    fn supports_native_restart(&self) -> bool {
        false
    }

    fn native_restart(&self) -> Result<()> {
        anyhow::bail!("当前宿主不支持原生重启")
    }

    /// 通用的重新加载方式
    fn reload(&self) -> Result<()>;
}

/// 命令行进程作为宿主：原生侧存储是数据目录里的一个文本文件
pub struct ProcessHost {
    platform: Platform,
    app_version: String,
    device_id: String,
    mirror_path: PathBuf,
}

impl ProcessHost {
    pub fn new(platform: Platform, mirror_path: PathBuf) -> Self {
        let device_id = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-device".to_string());
        Self {
            platform,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_id,
            mirror_path,
        }
    }

    pub fn with_app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = app_version.into();
        self
    }

    /// 原生侧当前记录的版本
    pub fn mirrored_version(&self) -> Option<String> {
        std::fs::read_to_string(&self.mirror_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl HostRuntime for ProcessHost {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn app_version(&self) -> String {
        self.app_version.clone()
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn mirror_bundle_version(&self, version: Option<&str>) -> Result<()> {
        match version {
            Some(v) => std::fs::write(&self.mirror_path, v).with_context(|| {
                format!("写入原生版本记录 '{}' 失败", self.mirror_path.display())
            }),
            None => match std::fs::remove_file(&self.mirror_path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| {
                    format!("删除原生版本记录 '{}' 失败", self.mirror_path.display())
                }),
            },
        }
    }

    fn reload(&self) -> Result<()> {
        info!("新的 bundle 将在应用下次启动时加载");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartChoice {
    Now,
    Later,
}

/// sync 过程中向用户确认
pub trait Prompter: Send + Sync {
    fn confirm_update(&self, info: &UpdateInfo) -> impl Future<Output = bool> + Send;

    fn confirm_restart(&self, version: &str) -> impl Future<Output = RestartChoice> + Send;
}

/// 固定答案，用于无人值守运行
#[derive(Debug, Clone, Copy)]
pub struct AutoPrompter {
    pub accept: bool,
    pub restart: RestartChoice,
}

impl Prompter for AutoPrompter {
    async fn confirm_update(&self, _info: &UpdateInfo) -> bool {
        self.accept
    }

    async fn confirm_restart(&self, _version: &str) -> RestartChoice {
        self.restart
    }
}

/// 在终端中询问
pub struct StdinPrompter;

impl StdinPrompter {
    async fn ask(question: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        if stdout.write_all(format!("{question} [y/N] ").as_bytes()).await.is_err() {
            return false;
        }
        let _ = stdout.flush().await;

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

impl Prompter for StdinPrompter {
    async fn confirm_update(&self, info: &UpdateInfo) -> bool {
        let version = info.version.as_deref().unwrap_or("?");
        if let Some(desc) = info.description.as_deref().filter(|d| !d.is_empty()) {
            println!("更新说明: {desc}");
        }
        Self::ask(&format!("发现新版本 {version}，是否立即下载？")).await
    }

    async fn confirm_restart(&self, version: &str) -> RestartChoice {
        if Self::ask(&format!("版本 {version} 已安装，是否立即重启？")).await {
            RestartChoice::Now
        } else {
            RestartChoice::Later
        }
    }
}
