//! 录制分块的后台上传。
//!
//! 原生录制层通过 [`Recorder`] 推送“分块就绪”事件，[`ChunkUploadQueue`]
//! 将其排队后串行上传，并在成功后清理本地文件。

mod queue;
mod recorder;
mod transport;

pub use queue::{
    ChunkUploadQueue, DrainReport, MAX_RETRIES, PROGRESS_DONE, PROGRESS_FAILED, ProgressMap,
    ProgressSubscription, QueueConfig,
};
pub use recorder::{ChannelRecorder, ChunkReady, Recorder};
pub use transport::{ChunkRequest, ChunkTransport, HttpChunkTransport};

use std::path::PathBuf;

/// 等待上传的单个录制分块
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    /// 本地文件路径，可以是普通路径或 `file://` URI
    pub path: String,
    pub chunk_index: u64,
    pub is_final: bool,
    pub match_id: String,
    pub retry_count: u32,
}

impl ChunkInfo {
    pub fn from_event(event: ChunkReady, match_id: &str) -> Self {
        Self {
            path: event.path,
            chunk_index: event.chunk_index,
            is_final: event.is_final,
            match_id: match_id.to_string(),
            retry_count: 0,
        }
    }

    /// 去掉 `file://` 前缀后的本地路径
    pub fn local_path(&self) -> PathBuf {
        resolve_local_path(&self.path)
    }
}

pub(crate) fn resolve_local_path(path: &str) -> PathBuf {
    match path.strip_prefix("file://") {
        Some(stripped) => PathBuf::from(stripped),
        None => PathBuf::from(path),
    }
}
