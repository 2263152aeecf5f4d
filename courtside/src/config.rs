use crate::ota::{InstallMode, OtaConfig};
use crate::upload::QueueConfig;
use anyhow::{Context, Result};
use courtside_common::interface::Platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// OTA 服务地址
    pub api_url: String,
    /// 分块上传服务地址，未设置时使用 api_url
    pub upload_base_url: Option<String>,
    /// OTA 状态与 bundle 缓存目录，未设置时使用系统数据目录
    pub data_dir: Option<PathBuf>,
    pub platform: Platform,
    pub install_mode: InstallMode,

    pub check_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    /// 重试退避基数（毫秒），0 表示立即重试
    pub retry_backoff_ms: u64,

    /// 日志文件路径，未设置时只输出到终端
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            upload_base_url: None,
            data_dir: None,
            platform: Platform::Android,
            install_mode: InstallMode::OnNextRestart,
            check_timeout_secs: 15,
            download_timeout_secs: 600,
            upload_timeout_secs: 120,
            retry_backoff_ms: 0,
            log_file: None,
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn upload_base_url(&self) -> &str {
        self.upload_base_url.as_deref().unwrap_or(&self.api_url)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn ota_config(&self) -> OtaConfig {
        OtaConfig {
            api_url: self.api_url.clone(),
            data_dir: self.data_dir(),
            install_mode: self.install_mode,
            check_timeout: Duration::from_secs(self.check_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..QueueConfig::default()
        }
    }

    /// 原生侧版本记录文件
    pub fn mirror_path(&self) -> PathBuf {
        self.data_dir().join("native-bundle-version")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courtside")
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("无法确定配置目录")?;

    let dir = base.join("courtside");
    fs::create_dir_all(&dir).context("创建配置目录失败")?;
    Ok(dir.join("config.toml"))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("读取配置文件 '{}' 失败", path.display()))?;
    toml::from_str(&content).context("解析配置文件失败")
}

/// 加载配置文件；不存在时写入带注释的默认配置并返回 None
pub fn load_or_create_config(path: &Path) -> Result<Option<Config>> {
    if path.exists() {
        return load_config(path).map(Some);
    }
    write_default_config(path)?;
    Ok(None)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    let default = Config::default();
    let config_content = format!(
        r#"# ================ 服务配置 =================

# OTA 服务地址
api_url = "{}"

# 分块上传服务地址 (默认与 api_url 相同)
# upload_base_url = "https://upload.example.com"

# ================ 设备配置 =================

# 平台: ios 或 android
platform = "{}"

# 安装方式: immediate (下载后立即重启) 或 on_next_restart
install_mode = "on_next_restart"

# OTA 状态与 bundle 缓存目录 (默认使用系统数据目录)
# data_dir = '/path/to/data'

# ================ 网络配置 =================

# 检查更新超时 (秒)
check_timeout_secs = {}

# 下载更新包超时 (秒)
download_timeout_secs = {}

# 单个分块上传超时 (秒)
upload_timeout_secs = {}

# 分块重试退避基数 (毫秒)，0 表示立即重试
retry_backoff_ms = {}

# 日志文件 (默认只输出到终端)
# log_file = 'courtside.log'
"#,
        default.api_url,
        default.platform,
        default.check_timeout_secs,
        default.download_timeout_secs,
        default.upload_timeout_secs,
        default.retry_backoff_ms,
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("创建配置目录失败")?;
    }
    fs::write(path, config_content).context("写入默认配置失败")?;
    Ok(())
}
