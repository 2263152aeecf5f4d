use anyhow::{Context, Result};

const DEFAULT_API_URL: &str = "http://localhost:3000";

/// 发布工具的运行配置，来自环境变量
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_url = match std::env::var("OTA_API_URL") {
            Ok(url) => url,
            Err(std::env::VarError::NotPresent) => DEFAULT_API_URL.to_string(),
            Err(e) => return Err(e).context("读取 OTA_API_URL 失败"),
        };
        let api_key = std::env::var("OTA_API_KEY").ok().filter(|k| !k.is_empty());
        Ok(Self::new(api_url, api_key))
    }

    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }
}
