use super::recorder::Recorder;
use super::transport::{ChunkRequest, ChunkTransport};
use super::{ChunkInfo, resolve_local_path};
use anyhow::Result;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个分块失败后最多重新排队的次数
pub const MAX_RETRIES: u32 = 3;
/// 上传完成
pub const PROGRESS_DONE: i32 = 100;
/// 上传失败（保留值）
pub const PROGRESS_FAILED: i32 = -1;

/// chunk_index -> 百分比，-1 表示失败
pub type ProgressMap = BTreeMap<u64, i32>;

type ProgressCallback = Arc<dyn Fn(&ProgressMap) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// stop_session 中等待最后一个分块事件的时间
    pub stop_grace: Duration,
    /// stop_session 等待队列排空的上限
    pub drain_timeout: Duration,
    /// 排空检查的轮询间隔
    pub drain_poll: Duration,
    /// 重试退避的基数，第 n 次重试等待 base * 2^(n-1)；为零时立即重试
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(30),
            drain_poll: Duration::from_millis(500),
            retry_backoff: Duration::ZERO,
        }
    }
}

impl QueueConfig {
    fn backoff_for(&self, retry_count: u32) -> Option<Duration> {
        if self.retry_backoff.is_zero() || retry_count == 0 {
            return None;
        }
        let factor = 1u32 << (retry_count - 1).min(16);
        Some(self.retry_backoff.saturating_mul(factor))
    }
}

/// stop_session 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    /// 是否在超时前排空
    pub drained: bool,
    /// 结束时仍在排队的分块数
    pub pending: usize,
    pub progress: ProgressMap,
}

struct QueuedChunk {
    chunk: ChunkInfo,
    not_before: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<QueuedChunk>,
    progress: ProgressMap,
    uploading: bool,
    // reset/cancel 时递增，用于丢弃旧会话中正在上传的分块结果
    generation: u64,
}

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, ProgressCallback)>>,
}

impl Observers {
    fn add(&self, callback: ProgressCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    fn remove(&self, id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(cb_id, _)| *cb_id != id);
    }

    fn notify(&self, snapshot: &ProgressMap) {
        let callbacks: Vec<ProgressCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(snapshot);
        }
    }
}

/// `on_progress` 返回的订阅句柄，调用 `unsubscribe` 取消订阅
pub struct ProgressSubscription {
    id: u64,
    observers: Weak<Observers>,
}

impl ProgressSubscription {
    pub fn unsubscribe(self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}

struct Listener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<T, R> {
    transport: T,
    recorder: R,
    config: QueueConfig,
    state: Mutex<QueueState>,
    observers: Arc<Observers>,
    listener: Mutex<Option<Listener>>,
}

/// 录制分块上传队列。
///
/// 按到达顺序串行上传；失败的分块追加到队尾重试，最多 [`MAX_RETRIES`] 次。
/// 任意时刻最多只有一个上传请求在进行。
pub struct ChunkUploadQueue<T, R> {
    inner: Arc<Inner<T, R>>,
}

impl<T, R> Clone for ChunkUploadQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ChunkTransport, R: Recorder> ChunkUploadQueue<T, R> {
    pub fn new(transport: T, recorder: R, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                recorder,
                config,
                state: Mutex::new(QueueState::default()),
                observers: Arc::new(Observers::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn recorder(&self) -> &R {
        &self.inner.recorder
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 重置队列并订阅录制事件，然后启动录制。
    ///
    /// 启动失败时订阅会先被撤销，再返回错误。
    pub async fn start_session(&self, session_id: &str) -> Result<()> {
        self.detach_listener().await;
        self.reset();

        let mut events = self.inner.recorder.subscribe();
        let token = CancellationToken::new();
        let this = self.clone();
        let match_id = session_id.to_string();
        let listener_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    maybe_event = events.recv() => match maybe_event {
                        Some(event) => this.on_chunk_ready(ChunkInfo::from_event(event, &match_id)),
                        None => {
                            debug!("录制事件通道已关闭，监听任务退出");
                            return;
                        }
                    },
                    _ = listener_token.cancelled() => break,
                }
            }
            // 取消前已经投递的事件仍然入队
            while let Ok(event) = events.try_recv() {
                this.on_chunk_ready(ChunkInfo::from_event(event, &match_id));
            }
            debug!("录制事件订阅已撤销");
        });
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Listener { token, handle });

        if let Err(e) = self.inner.recorder.start(session_id).await {
            error!(session_id, error = %e, "启动录制失败");
            self.detach_listener().await;
            return Err(e.context("启动录制失败"));
        }

        info!(session_id, "录制会话已开始");
        Ok(())
    }

    /// 停止录制并尽力等待队列排空，超时不会报错。
    pub async fn stop_session(&self) -> DrainReport {
        if let Err(e) = self.inner.recorder.stop().await {
            warn!(error = %e, "停止录制失败，继续等待队列排空");
        }

        // 等待最后一个分块事件
        tokio::time::sleep(self.inner.config.stop_grace).await;
        self.detach_listener().await;

        let deadline = Instant::now() + self.inner.config.drain_timeout;
        let drained = loop {
            if self.is_idle() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(self.inner.config.drain_poll).await;
        };

        let report = {
            let st = self.state();
            DrainReport {
                drained,
                pending: st.queue.len(),
                progress: st.progress.clone(),
            }
        };
        if drained {
            info!("录制会话已结束，所有分块处理完毕");
        } else {
            warn!(pending = report.pending, "等待上传队列排空超时");
        }
        report
    }

    /// 注册进度观察者，每次状态变化都会收到完整快照
    pub fn on_progress<F>(&self, callback: F) -> ProgressSubscription
    where
        F: Fn(&ProgressMap) + Send + Sync + 'static,
    {
        let id = self.inner.observers.add(Arc::new(callback));
        ProgressSubscription {
            id,
            observers: Arc::downgrade(&self.inner.observers),
        }
    }

    /// 清空待上传队列与进度，不影响正在上传的分块
    pub fn cancel_all(&self) {
        let dropped = {
            let mut st = self.state();
            let dropped = st.queue.len();
            st.queue.clear();
            st.progress.clear();
            st.generation += 1;
            dropped
        };
        info!(dropped, "已取消所有待上传分块");
        self.notify();
    }

    pub fn progress(&self) -> ProgressMap {
        self.state().progress.clone()
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_uploading(&self) -> bool {
        self.state().uploading
    }

    /// 没有排队的分块且没有上传循环在运行
    pub fn is_idle(&self) -> bool {
        let st = self.state();
        !st.uploading && st.queue.is_empty()
    }

    fn reset(&self) {
        {
            let mut st = self.state();
            st.queue.clear();
            st.progress.clear();
            st.generation += 1;
        }
        self.notify();
    }

    async fn detach_listener(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.token.cancel();
            if let Err(e) = listener.handle.await {
                warn!("录制事件监听任务异常退出: {e:?}");
            }
        }
    }

    fn notify(&self) {
        let snapshot = self.progress();
        self.inner.observers.notify(&snapshot);
    }

    /// 分块入队；没有上传循环时启动一个。不会等待上传。
    pub(crate) fn on_chunk_ready(&self, chunk: ChunkInfo) {
        debug!(chunk_index = chunk.chunk_index, is_final = chunk.is_final, "分块入队");
        let start_drain = {
            let mut st = self.state();
            st.queue.push_back(QueuedChunk {
                chunk,
                not_before: None,
            });
            !std::mem::replace(&mut st.uploading, true)
        };

        if start_drain {
            let this = self.clone();
            tokio::spawn(async move { this.drain_queue().await });
        }
    }

    async fn drain_queue(&self) {
        debug!("上传循环开始");
        loop {
            let next = {
                let mut st = self.state();
                let waiting = st
                    .queue
                    .front()
                    .and_then(|job| job.not_before)
                    .filter(|at| *at > Instant::now());
                match waiting {
                    // 退避中的分块留在队首，cancel_all 仍可将其丢弃
                    Some(at) => Next::Wait(at),
                    None => match st.queue.pop_front() {
                        Some(job) => Next::Upload(job.chunk, st.generation),
                        None => {
                            // 与入队在同一把锁下清除标记，避免丢失唤醒
                            st.uploading = false;
                            break;
                        }
                    },
                }
            };

            match next {
                Next::Wait(at) => tokio::time::sleep_until(at).await,
                Next::Upload(chunk, generation) => self.process_chunk(chunk, generation).await,
            }
        }
        debug!("上传循环结束，队列已空");
    }

    async fn process_chunk(&self, chunk: ChunkInfo, generation: u64) {
        let chunk_index = chunk.chunk_index;
        let raw_path = chunk.local_path();

        let metadata = match tokio::fs::metadata(&raw_path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                // 文件已不存在，无法重试
                warn!(chunk_index, path = %raw_path.display(), "分块文件不存在，跳过");
                self.record_outcome(generation, chunk_index, PROGRESS_FAILED);
                return;
            }
        };
        let path = tokio::fs::canonicalize(&raw_path)
            .await
            .unwrap_or_else(|_| raw_path.clone());

        let request = ChunkRequest {
            path,
            match_id: chunk.match_id.clone(),
            chunk_index,
            is_final: chunk.is_final,
            file_size: metadata.len(),
        };

        match self.upload_one(&request).await {
            Ok(()) => {
                remove_local(&request.path, &chunk.path).await;
                self.record_outcome(generation, chunk_index, PROGRESS_DONE);
            }
            Err(e) => {
                warn!(chunk_index, retry = chunk.retry_count, "分块上传失败: {e:#}");
                self.record_failure(generation, chunk);
            }
        }
    }

    /// 先走流式上传，任何失败都改用表单上传
    async fn upload_one(&self, req: &ChunkRequest) -> Result<()> {
        let transport = &self.inner.transport;
        match transport.upload_streaming(req).await {
            Ok(()) => {
                info!(
                    chunk_index = req.chunk_index,
                    strategy = "streaming",
                    size_mb = %courtside_common::utils::size_in_mb(req.file_size),
                    "分块上传成功"
                );
                Ok(())
            }
            Err(primary) => {
                debug!(chunk_index = req.chunk_index, "流式上传失败，改用表单上传: {primary:#}");
                transport.upload_buffered(req).await?;
                info!(
                    chunk_index = req.chunk_index,
                    strategy = "buffered",
                    size_mb = %courtside_common::utils::size_in_mb(req.file_size),
                    "分块上传成功"
                );
                Ok(())
            }
        }
    }

    /// 写入进度并通知观察者；会话已被重置时只记录日志
    fn record_outcome(&self, generation: u64, chunk_index: u64, value: i32) {
        {
            let mut st = self.state();
            if st.generation != generation {
                debug!(chunk_index, value, "会话已重置，忽略旧分块的结果");
                return;
            }
            st.progress.insert(chunk_index, value);
        }
        self.notify();
    }

    /// 标记失败并在同一把锁下重新排队，旧会话的分块不会混入新队列
    fn record_failure(&self, generation: u64, chunk: ChunkInfo) {
        let chunk_index = chunk.chunk_index;
        {
            let mut st = self.state();
            if st.generation != generation {
                debug!(chunk_index, "会话已重置，丢弃旧分块的重试");
                return;
            }
            st.progress.insert(chunk_index, PROGRESS_FAILED);

            if chunk.retry_count < MAX_RETRIES {
                let retry_count = chunk.retry_count + 1;
                let not_before = self
                    .inner
                    .config
                    .backoff_for(retry_count)
                    .map(|d| Instant::now() + d);
                st.queue.push_back(QueuedChunk {
                    chunk: ChunkInfo {
                        retry_count,
                        ..chunk
                    },
                    not_before,
                });
                debug!(chunk_index, retry_count, "分块已重新排到队尾");
            } else {
                error!(chunk_index, "分块重试 {MAX_RETRIES} 次后仍失败，已放弃");
            }
        }
        self.notify();
    }
}

enum Next {
    Wait(Instant),
    Upload(ChunkInfo, u64),
}

/// 删除已上传的本地文件；失败只记日志，并尝试一次原始路径
async fn remove_local(canonical: &Path, original: &str) {
    let Err(e) = tokio::fs::remove_file(canonical).await else {
        return;
    };
    warn!(path = %canonical.display(), "删除已上传分块失败: {e}");

    let fallback = resolve_local_path(original);
    if fallback != canonical {
        if let Err(e) = tokio::fs::remove_file(&fallback).await {
            warn!(path = %fallback.display(), "备用路径删除同样失败: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::{ChannelRecorder, ChunkReady};
    use anyhow::{anyhow, bail};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{Notify, Semaphore};

    #[derive(Default)]
    struct MockTransport {
        // chunk_index -> 剩余失败次数
        failures: Mutex<HashMap<u64, usize>>,
        streaming_ok: bool,
        attempts: Mutex<Vec<(u64, &'static str, bool)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        started: Notify,
        gate: Option<Arc<Semaphore>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                streaming_ok: true,
                ..Default::default()
            }
        }

        fn fail(self, chunk_index: u64, times: usize) -> Self {
            self.failures.lock().unwrap().insert(chunk_index, times);
            self
        }

        fn attempts(&self) -> Vec<(u64, &'static str, bool)> {
            self.attempts.lock().unwrap().clone()
        }

        fn successes(&self) -> Vec<u64> {
            self.attempts()
                .into_iter()
                .filter(|(_, _, ok)| *ok)
                .map(|(idx, _, _)| idx)
                .collect()
        }

        async fn attempt(&self, req: &ChunkRequest, strategy: &'static str) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            tokio::task::yield_now().await;

            let fail = {
                let mut failures = self.failures.lock().unwrap();
                match failures.get_mut(&req.chunk_index) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            self.attempts
                .lock()
                .unwrap()
                .push((req.chunk_index, strategy, !fail));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if fail {
                bail!("模拟服务端 500");
            }
            Ok(())
        }
    }

    impl ChunkTransport for MockTransport {
        async fn upload_streaming(&self, req: &ChunkRequest) -> Result<()> {
            if !self.streaming_ok {
                return Err(anyhow!("流式上传不可用"));
            }
            self.attempt(req, "streaming").await
        }

        async fn upload_buffered(&self, req: &ChunkRequest) -> Result<()> {
            self.attempt(req, "buffered").await
        }
    }

    // 流式上传失败时表单上传还会再试一次，这里让流式不可用，每次入队只对应一次尝试
    fn single_attempt(transport: MockTransport) -> MockTransport {
        MockTransport {
            streaming_ok: false,
            ..transport
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            stop_grace: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(5),
            drain_poll: Duration::from_millis(10),
            retry_backoff: Duration::ZERO,
        }
    }

    fn make_chunks(dir: &Path, count: u64) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("chunk_{i}.mp4"));
                std::fs::write(&path, vec![i as u8; 1024]).unwrap();
                path
            })
            .collect()
    }

    fn chunk(path: &Path, index: u64, is_final: bool) -> ChunkInfo {
        ChunkInfo {
            path: path.to_string_lossy().into_owned(),
            chunk_index: index,
            is_final,
            match_id: "match-42".into(),
            retry_count: 0,
        }
    }

    async fn wait_idle<T: ChunkTransport, R: Recorder>(queue: &ChunkUploadQueue<T, R>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_idle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("队列未在预期时间内排空");
    }

    #[tokio::test]
    async fn retried_chunk_goes_to_tail_and_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 3);
        let transport = single_attempt(MockTransport::new().fail(1, 2));
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        queue.on_chunk_ready(chunk(&files[0], 0, false));
        queue.on_chunk_ready(chunk(&files[1], 1, false));
        queue.on_chunk_ready(chunk(&files[2], 2, true));
        wait_idle(&queue).await;

        let progress = queue.progress();
        assert_eq!(progress, BTreeMap::from([(0, 100), (1, 100), (2, 100)]));

        let order: Vec<(u64, bool)> = queue
            .transport()
            .attempts()
            .into_iter()
            .map(|(idx, _, ok)| (idx, ok))
            .collect();
        assert_eq!(
            order,
            vec![(0, true), (1, false), (2, true), (1, false), (1, true)]
        );
        for file in &files {
            assert!(!file.exists(), "已上传的分块应被删除");
        }
    }

    #[tokio::test]
    async fn exhausted_retries_leave_failure_mark() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 2);
        let transport = single_attempt(MockTransport::new().fail(0, usize::MAX));
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        queue.on_chunk_ready(chunk(&files[0], 0, false));
        queue.on_chunk_ready(chunk(&files[1], 1, true));
        wait_idle(&queue).await;

        let attempts_on_0 = queue
            .transport()
            .attempts()
            .iter()
            .filter(|(idx, _, _)| *idx == 0)
            .count();
        assert_eq!(attempts_on_0, 1 + MAX_RETRIES as usize);
        assert_eq!(queue.progress(), BTreeMap::from([(0, -1), (1, 100)]));
        assert!(files[0].exists(), "失败的分块不应删除");
        assert!(!files[1].exists());
    }

    #[tokio::test]
    async fn never_more_than_one_upload_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 6);
        let transport = MockTransport::new().fail(2, 1).fail(4, 2);
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        for (i, file) in files.iter().enumerate() {
            queue.on_chunk_ready(chunk(file, i as u64, i == 5));
            tokio::task::yield_now().await;
        }
        wait_idle(&queue).await;

        assert_eq!(queue.transport().max_in_flight.load(Ordering::SeqCst), 1);
        assert!(queue.progress().values().all(|v| *v == PROGRESS_DONE));
        assert_eq!(queue.progress().len(), 6);
    }

    #[tokio::test]
    async fn falls_back_to_buffered_upload() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 1);
        let transport = single_attempt(MockTransport::new());
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        queue.on_chunk_ready(chunk(&files[0], 0, true));
        wait_idle(&queue).await;

        assert_eq!(queue.transport().attempts(), vec![(0, "buffered", true)]);
        assert_eq!(queue.progress().get(&0), Some(&PROGRESS_DONE));
    }

    #[tokio::test]
    async fn missing_file_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ChunkUploadQueue::new(MockTransport::new(), ChannelRecorder::new(), fast_config());

        let ghost = dir.path().join("gone.mp4");
        queue.on_chunk_ready(chunk(&ghost, 0, false));
        wait_idle(&queue).await;

        assert!(queue.transport().attempts().is_empty());
        assert_eq!(queue.progress(), BTreeMap::from([(0, PROGRESS_FAILED)]));
    }

    #[tokio::test]
    async fn file_uri_paths_are_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 1);
        let queue = ChunkUploadQueue::new(MockTransport::new(), ChannelRecorder::new(), fast_config());

        let mut info = chunk(&files[0], 0, true);
        info.path = format!("file://{}", files[0].display());
        queue.on_chunk_ready(info);
        wait_idle(&queue).await;

        assert_eq!(queue.transport().successes(), vec![0]);
        assert!(!files[0].exists());
    }

    #[tokio::test]
    async fn cancel_all_keeps_in_flight_upload() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 3);
        let gate = Arc::new(Semaphore::new(0));
        let transport = MockTransport {
            gate: Some(gate.clone()),
            ..MockTransport::new()
        };
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        for (i, file) in files.iter().enumerate() {
            queue.on_chunk_ready(chunk(file, i as u64, i == 2));
        }
        queue.transport().started.notified().await;

        queue.cancel_all();
        assert_eq!(queue.pending(), 0);
        assert!(queue.progress().is_empty());
        assert!(queue.is_uploading());

        gate.add_permits(1);
        wait_idle(&queue).await;

        assert_eq!(queue.transport().successes(), vec![0]);
        assert!(!files[0].exists(), "进行中的上传应正常完成");
        assert!(files[1].exists());
        assert!(files[2].exists());
        assert!(queue.progress().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_drops_chunk_waiting_on_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 1);
        let transport = single_attempt(MockTransport::new().fail(0, 1));
        let config = QueueConfig {
            retry_backoff: Duration::from_millis(300),
            ..fast_config()
        };
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), config);

        queue.on_chunk_ready(chunk(&files[0], 0, true));
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.transport().attempts().len() < 1 || queue.pending() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("分块未进入退避等待");

        // 退避中的分块仍在队列里
        assert_eq!(queue.pending(), 1);
        queue.cancel_all();
        assert_eq!(queue.pending(), 0);
        wait_idle(&queue).await;

        assert_eq!(queue.transport().attempts(), vec![(0, "buffered", false)]);
        assert!(files[0].exists(), "已取消的分块不应上传或删除");
        assert!(queue.progress().is_empty());
    }

    #[tokio::test]
    async fn failure_after_cancel_is_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 1);
        let gate = Arc::new(Semaphore::new(0));
        let transport = MockTransport {
            gate: Some(gate.clone()),
            ..single_attempt(MockTransport::new().fail(0, 1))
        };
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), fast_config());

        queue.on_chunk_ready(chunk(&files[0], 0, true));
        queue.transport().started.notified().await;
        queue.cancel_all();

        gate.add_permits(1);
        wait_idle(&queue).await;

        assert_eq!(queue.transport().attempts(), vec![(0, "buffered", false)]);
        assert_eq!(queue.pending(), 0);
        assert!(queue.progress().is_empty());
        assert!(files[0].exists());
    }

    #[tokio::test]
    async fn observers_receive_snapshots_until_unsubscribed() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 2);
        let queue = ChunkUploadQueue::new(MockTransport::new(), ChannelRecorder::new(), fast_config());

        let seen: Arc<Mutex<Vec<ProgressMap>>> = Arc::default();
        let sink = seen.clone();
        let sub = queue.on_progress(move |snapshot| sink.lock().unwrap().push(snapshot.clone()));

        queue.on_chunk_ready(chunk(&files[0], 0, false));
        wait_idle(&queue).await;
        sub.unsubscribe();

        queue.on_chunk_ready(chunk(&files[1], 1, true));
        wait_idle(&queue).await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![BTreeMap::from([(0u64, 100i32)])]);
    }

    #[tokio::test]
    async fn session_lifecycle_uploads_recorded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 3);
        let queue = ChunkUploadQueue::new(MockTransport::new(), ChannelRecorder::new(), fast_config());

        queue.start_session("match-7").await.unwrap();
        assert!(queue.recorder().is_recording());
        for (i, file) in files.iter().enumerate() {
            queue.recorder().emit(ChunkReady {
                path: file.to_string_lossy().into_owned(),
                chunk_index: i as u64,
                is_final: i == 2,
            });
        }

        let report = queue.stop_session().await;
        assert!(report.drained);
        assert_eq!(report.pending, 0);
        assert_eq!(report.progress.len(), 3);
        assert!(!queue.recorder().is_recording());

        // 订阅已撤销，之后的事件不再入队
        assert_eq!(
            queue.recorder().emit(ChunkReady {
                path: "late.mp4".into(),
                chunk_index: 9,
                is_final: false,
            }),
            0
        );
    }

    #[tokio::test]
    async fn stop_session_reports_timeout_when_upload_hangs() {
        let dir = tempfile::tempdir().unwrap();
        let files = make_chunks(dir.path(), 2);
        let transport = MockTransport {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..MockTransport::new()
        };
        let config = QueueConfig {
            drain_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let queue = ChunkUploadQueue::new(transport, ChannelRecorder::new(), config);

        queue.start_session("match-8").await.unwrap();
        for (i, file) in files.iter().enumerate() {
            queue.recorder().emit(ChunkReady {
                path: file.to_string_lossy().into_owned(),
                chunk_index: i as u64,
                is_final: i == 1,
            });
        }

        let report = queue.stop_session().await;
        assert!(!report.drained);
        assert_eq!(report.pending, 1);
    }

    struct RejectingRecorder(ChannelRecorder);

    impl Recorder for RejectingRecorder {
        fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ChunkReady> {
            self.0.subscribe()
        }

        async fn start(&self, _session_id: &str) -> Result<()> {
            bail!("相机权限被拒绝")
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_start_tears_down_subscription() {
        let queue = ChunkUploadQueue::new(
            MockTransport::new(),
            RejectingRecorder(ChannelRecorder::new()),
            fast_config(),
        );

        assert!(queue.start_session("match-9").await.is_err());
        let delivered = queue.recorder().0.emit(ChunkReady {
            path: "x.mp4".into(),
            chunk_index: 0,
            is_final: false,
        });
        assert_eq!(delivered, 0);
        assert!(queue.is_idle());
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let config = QueueConfig {
            retry_backoff: Duration::from_millis(100),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff_for(1), Some(Duration::from_millis(100)));
        assert_eq!(config.backoff_for(3), Some(Duration::from_millis(400)));
        assert_eq!(QueueConfig::default().backoff_for(2), None);
    }
}
