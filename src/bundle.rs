use anyhow::{Context, Result, bail};
use courtside_common::interface::Platform;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// 覆盖默认构建命令的环境变量
pub const BUILD_CMD_ENV: &str = "OTA_BUILD_CMD";

const DEFAULT_BUILD_CMD: &str = "npx react-native bundle --platform {platform} --dev false \
     --entry-file index.js --bundle-output {output} --assets-dest {assets}";

/// 本地构建产物，上传成功后整个目录会被删除
#[derive(Debug)]
pub struct BuildOutput {
    pub dir: PathBuf,
    pub bundle: PathBuf,
}

impl BuildOutput {
    pub async fn remove(self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!("删除构建目录 '{}' 失败: {e}", self.dir.display());
        }
    }
}

pub fn build_command_template() -> String {
    std::env::var(BUILD_CMD_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BUILD_CMD.to_string())
}

pub fn render_command(template: &str, platform: Platform, output: &Path, assets: &Path) -> String {
    template
        .replace("{platform}", platform.as_str())
        .replace("{output}", &output.to_string_lossy())
        .replace("{assets}", &assets.to_string_lossy())
}

/// 在 `root/<platform>` 下执行构建命令，返回生成的 bundle
pub async fn build_bundle(template: &str, platform: Platform, root: &Path) -> Result<BuildOutput> {
    let dir = root.join(platform.as_str());
    if dir.exists() {
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("清理旧的构建目录 '{}' 失败", dir.display()))?;
    }
    let assets = dir.join("assets");
    tokio::fs::create_dir_all(&assets)
        .await
        .with_context(|| format!("创建构建目录 '{}' 失败", dir.display()))?;

    let bundle = dir.join(platform.bundle_file_name());
    let command_line = render_command(template, platform, &bundle, &assets);
    debug!("构建命令: {command_line}");

    let status = shell(&command_line)
        .status()
        .await
        .with_context(|| format!("无法执行构建命令 '{command_line}'"))?;
    if !status.success() {
        bail!("构建命令执行失败 ({status})");
    }
    if !bundle.is_file() {
        bail!("构建完成但未找到 bundle 文件 '{}'", bundle.display());
    }

    Ok(BuildOutput { dir, bundle })
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

#[cfg(not(windows))]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}
