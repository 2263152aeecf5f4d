use anyhow::{Result, bail};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 原生录制层发出的“分块就绪”事件
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReady {
    pub path: String,
    pub chunk_index: u64,
    pub is_final: bool,
}

/// 录制子系统。
///
/// 事件通过 `subscribe` 返回的通道投递；通道关闭即表示不会再有事件。
pub trait Recorder: Send + Sync + 'static {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChunkReady>;

    fn start(&self, session_id: &str) -> impl Future<Output = Result<()>> + Send;

    fn stop(&self) -> impl Future<Output = Result<()>> + Send;
}

/// 进程内录制器：由宿主调用 `emit` 推送分块事件
#[derive(Default)]
pub struct ChannelRecorder {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChunkReady>>>,
    session: Mutex<Option<String>>,
    recording: AtomicBool,
}

impl ChannelRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 向所有仍在监听的订阅者广播事件，返回送达的订阅者数量
    pub fn emit(&self, event: ChunkReady) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in subscribers.iter() {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(chunk_index = event.chunk_index, delivered, "分块事件已广播");
        delivered
    }
}

impl Recorder for ChannelRecorder {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChunkReady> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    async fn start(&self, session_id: &str) -> Result<()> {
        if self.recording.swap(true, Ordering::SeqCst) {
            bail!("录制已在进行中");
        }
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        info!(session_id, "开始录制");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            bail!("当前没有进行中的录制");
        }
        info!("录制已停止");
        Ok(())
    }
}
