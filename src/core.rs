use crate::config::Config;

use anyhow::{Context, Result, bail};
use courtside_common::consts::{OTA_ROLLBACK_PATH, OTA_UPLOAD_PATH, OTA_VERSIONS_PATH};
use courtside_common::interface::{Platform, RollbackRequest, UploadResponse, VersionList};
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, multipart};
use std::path::PathBuf;
use tracing::debug;

/// 一次发布的参数
#[derive(Debug, Clone)]
pub struct Release {
    pub platform: Platform,
    pub version: String,
    pub mandatory: bool,
    pub description: String,
    pub min_app_version: Option<String>,
    pub bundle: PathBuf,
}

fn authorize(builder: RequestBuilder, cfg: &Config) -> RequestBuilder {
    match &cfg.api_key {
        Some(key) => builder.header(AUTHORIZATION, format!("Bearer {}", key)),
        None => builder,
    }
}

pub async fn upload_bundle(cfg: &Config, release: &Release) -> Result<UploadResponse> {
    let data = tokio::fs::read(&release.bundle)
        .await
        .with_context(|| format!("读取 bundle 文件 '{}' 失败", release.bundle.display()))?;
    let file_name = release
        .bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| release.platform.bundle_file_name().to_string());

    let mut form = multipart::Form::new()
        .part(
            "bundle",
            multipart::Part::bytes(data)
                .file_name(file_name)
                .mime_str("application/javascript")?,
        )
        .text("platform", release.platform.as_str())
        .text("version", release.version.clone())
        .text("mandatory", release.mandatory.to_string())
        .text("description", release.description.clone());
    if let Some(min_app) = &release.min_app_version {
        form = form.text("minAppVersion", min_app.clone());
    }

    let client = reqwest::Client::new();
    let resp = authorize(client.post(cfg.url(OTA_UPLOAD_PATH)), cfg)
        .multipart(form)
        .send()
        .await
        .context("上传请求失败")?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        bail!("上传失败：状态 {}，响应：{}", status, text);
    }
    debug!("上传响应: {text}");
    serde_json::from_str(&text).context("解析上传响应失败")
}

pub async fn list_versions(cfg: &Config, platform: Platform) -> Result<VersionList> {
    let url = format!("{}/{}", cfg.url(OTA_VERSIONS_PATH), platform);
    let resp = authorize(reqwest::Client::new().get(&url), cfg)
        .send()
        .await
        .context("请求版本列表失败")?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        bail!("获取版本列表失败：状态 {}，响应：{}", status, text);
    }
    serde_json::from_str(&text).context("解析版本列表失败")
}

pub async fn rollback(cfg: &Config, platform: Platform, version: &str) -> Result<String> {
    let body = RollbackRequest {
        platform,
        version: version.to_string(),
    };
    let resp = authorize(reqwest::Client::new().post(cfg.url(OTA_ROLLBACK_PATH)), cfg)
        .json(&body)
        .send()
        .await
        .context("回滚请求失败")?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        bail!("回滚失败：状态 {}，响应：{}", status, text);
    }
    Ok(text)
}
