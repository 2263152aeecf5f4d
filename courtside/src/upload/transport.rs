use anyhow::{Context, Result, bail};
use courtside_common::consts::CHUNK_UPLOAD_PATH;
use courtside_common::utils::size_in_mb;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::io::ReaderStream;

/// 一次分块上传请求（文件已确认存在、大小已计算）
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub path: PathBuf,
    pub match_id: String,
    pub chunk_index: u64,
    pub is_final: bool,
    pub file_size: u64,
}

impl ChunkRequest {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("chunk_{}.mp4", self.chunk_index))
    }

    pub fn mime(&self) -> &'static str {
        match self.path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("mp4") => "video/mp4",
            Some(ext) if ext.eq_ignore_ascii_case("ts") => "video/mp2t",
            _ => "application/octet-stream",
        }
    }

    /// 除文件外的表单字段
    fn form_fields(&self) -> Form {
        Form::new()
            .text("matchId", self.match_id.clone())
            .text("chunkIndex", self.chunk_index.to_string())
            .text("isFinal", if self.is_final { "1" } else { "0" })
            .text("fileSizeMB", size_in_mb(self.file_size))
    }
}

/// 分块上传通道。
///
/// 队列先尝试 `upload_streaming`，失败（任何错误）后再用 `upload_buffered`。
/// 两者都必须把非 2xx 响应视为失败。
pub trait ChunkTransport: Send + Sync + 'static {
    fn upload_streaming(&self, req: &ChunkRequest) -> impl Future<Output = Result<()>> + Send;

    fn upload_buffered(&self, req: &ChunkRequest) -> impl Future<Output = Result<()>> + Send;
}

pub struct HttpChunkTransport {
    client: Client,
    endpoint: String,
}

impl HttpChunkTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("创建 reqwest 客户端失败")?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), CHUNK_UPLOAD_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, req: &ChunkRequest, form: Form) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("发送分块 #{} 上传请求失败", req.chunk_index))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "上传分块 #{} 失败：状态 {}，响应：{}",
                req.chunk_index,
                status,
                text
            );
        }
        Ok(())
    }
}

impl ChunkTransport for HttpChunkTransport {
    async fn upload_streaming(&self, req: &ChunkRequest) -> Result<()> {
        let file = tokio::fs::File::open(&req.path)
            .await
            .with_context(|| format!("打开分块文件 '{}' 失败", req.path.display()))?;
        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, req.file_size)
            .file_name(req.file_name())
            .mime_str(req.mime())?;

        self.send(req, req.form_fields().part("file", part)).await
    }

    async fn upload_buffered(&self, req: &ChunkRequest) -> Result<()> {
        let data = tokio::fs::read(&req.path)
            .await
            .with_context(|| format!("读取分块文件 '{}' 失败", req.path.display()))?;
        let part = Part::bytes(data)
            .file_name(req.file_name())
            .mime_str(req.mime())?;

        self.send(req, req.form_fields().part("file", part)).await
    }
}
