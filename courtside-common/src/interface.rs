use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 目标平台，线上协议中使用小写名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// 平台约定的 bundle 文件名
    pub fn bundle_file_name(&self) -> &'static str {
        match self {
            Platform::Ios => "main.jsbundle",
            Platform::Android => "index.android.bundle",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(format!("无效的平台 '{other}'，仅支持 ios 或 android")),
        }
    }
}

/// 版本检查接口返回的候选更新包。
///
/// `update_available` 为 false 时其余字段没有意义。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateInfo {
    pub update_available: bool,
    pub version: Option<String>,
    pub download_url: Option<String>,
    /// 更新包内容的 SHA-256（十六进制）
    pub hash: Option<String>,
    pub size: Option<u64>,
    pub mandatory: bool,
    pub description: Option<String>,
}

impl UpdateInfo {
    /// 安全的“无更新”结果
    pub fn none() -> Self {
        Self::default()
    }
}

/// 已发布的单个版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub version: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub uploaded_at: Option<String>,
}

// Versions 接口
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionList {
    #[serde(default)]
    pub versions: Vec<VersionEntry>,
}

// Upload 接口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub version: String,
    pub platform: Platform,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: Option<String>,
}

// Rollback 接口
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub platform: Platform,
    pub version: String,
}
