use super::cache::{BundleCache, is_safe_version};
use super::host::{HostRuntime, Prompter, RestartChoice};
use super::store::KvStore;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use courtside_common::consts::{DEFAULT_BUNDLE_VERSION, OTA_CHECK_PATH};
use courtside_common::interface::{Platform, UpdateInfo};
use courtside_common::utils::{calc_sha256, digest_eq};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const BUNDLE_VERSION_KEY: &str = "@ota_bundle_version";
const PENDING_UPDATE_KEY: &str = "@ota_pending_update";
const LAST_CHECK_KEY: &str = "@ota_last_check";

const STATE_FILE_NAME: &str = "ota-state.json";
const CACHE_DIR_NAME: &str = "ota-bundles";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// 下载完成后立即重启
    Immediate,
    /// 等待下次启动
    #[default]
    OnNextRestart,
}

#[derive(Debug, Clone)]
pub struct OtaConfig {
    pub api_url: String,
    /// 状态文件与 bundle 缓存所在目录
    pub data_dir: PathBuf,
    pub install_mode: InstallMode,
    pub check_timeout: Duration,
    pub download_timeout: Duration,
}

impl OtaConfig {
    pub fn new(api_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_url: api_url.into(),
            data_dir: data_dir.into(),
            install_mode: InstallMode::default(),
            check_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(600),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE_NAME)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join(CACHE_DIR_NAME)
    }
}

/// 调用方误用时返回的错误；网络与磁盘问题不会以错误形式出现
#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("更新信息缺少必要字段 `{0}`")]
    MissingField(&'static str),
    #[error("非法的版本号 '{0}'")]
    InvalidVersion(String),
}

/// 已下载、等待下次启动加载的更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    pub version: String,
    pub path: PathBuf,
    /// 毫秒时间戳
    pub installed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable,
    Downloading,
    Downloaded,
    Installed,
}

/// sync 过程中的阶段通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    CheckingForUpdate,
    UpToDate,
    UpdateAvailable,
    AwaitingUserAction,
    Downloading,
    UpdateInstalled,
    UpdateIgnored,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    UpToDate,
    /// 用户拒绝了更新
    Declined,
    Installed { version: String, restarted: bool },
    Failed,
}

#[derive(Default)]
pub struct SyncOptions {
    pub show_prompt: bool,
    pub on_status_change: Option<Box<dyn Fn(SyncStatus) + Send + Sync>>,
    pub on_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,
}

/// 诊断信息快照
#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    pub current_version: String,
    pub last_check: Option<DateTime<Utc>>,
    pub has_pending_update: bool,
    pub pending_update: Option<PendingUpdate>,
    pub app_version: String,
    pub device_id: String,
    pub platform: Platform,
    pub state: OtaState,
}

/// 进入时置位、离开作用域时清除的标记
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// OTA 更新客户端。
///
/// 对外的网络操作不会返回环境错误：检查失败得到“无更新”，下载失败得到 `false`。
pub struct OtaClient<H> {
    config: OtaConfig,
    http: reqwest::Client,
    store: KvStore,
    cache: BundleCache,
    host: H,
    checking: AtomicBool,
    downloading: AtomicBool,
    state: Mutex<OtaState>,
}

impl<H: HostRuntime> OtaClient<H> {
    pub async fn new(config: OtaConfig, host: H) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.check_timeout)
            .build()
            .context("创建 reqwest 客户端失败")?;
        let store = KvStore::open(config.state_path()).await?;
        let cache = BundleCache::new(config.cache_dir());
        cache.ensure().await?;

        Ok(Self {
            config,
            http,
            store,
            cache,
            host,
            checking: AtomicBool::new(false),
            downloading: AtomicBool::new(false),
            state: Mutex::new(OtaState::Idle),
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn state(&self) -> OtaState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: OtaState) {
        debug!(?state, "OTA 状态变更");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub async fn get_current_bundle_version(&self) -> String {
        self.store
            .get(BUNDLE_VERSION_KEY)
            .await
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BUNDLE_VERSION.to_string())
    }

    pub async fn get_pending_update(&self) -> Option<PendingUpdate> {
        let raw = self.store.get(PENDING_UPDATE_KEY).await?;
        match serde_json::from_str(&raw) {
            Ok(pending) => Some(pending),
            Err(e) => {
                warn!("pendingUpdate 记录无法解析: {e}");
                None
            }
        }
    }

    pub async fn last_check(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.store.get(LAST_CHECK_KEY).await?.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// 向服务端查询是否有新版本，任何失败都返回“无更新”
    pub async fn check_for_update(&self) -> UpdateInfo {
        let Some(_guard) = FlagGuard::acquire(&self.checking) else {
            debug!("已有检查在进行，本次返回无更新");
            return UpdateInfo::none();
        };
        self.set_state(OtaState::Checking);

        let info = match timeout(self.config.check_timeout, self.fetch_update_info()).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                warn!("检查更新失败: {e:#}");
                UpdateInfo::none()
            }
            Err(_) => {
                warn!(timeout = ?self.config.check_timeout, "检查更新超时");
                UpdateInfo::none()
            }
        };

        if info.update_available {
            info!(
                version = info.version.as_deref().unwrap_or("?"),
                mandatory = info.mandatory,
                "发现新版本"
            );
            self.set_state(OtaState::UpdateAvailable);
        } else {
            self.set_state(OtaState::NoUpdate);
        }
        info
    }

    async fn fetch_update_info(&self) -> Result<UpdateInfo> {
        let bundle_version = self.get_current_bundle_version().await;
        let app_version = self.host.app_version();
        let platform = self.host.platform();
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), OTA_CHECK_PATH);

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("platform", platform.as_str()),
                ("bundleVersion", bundle_version.as_str()),
                ("appVersion", app_version.as_str()),
            ])
            .send()
            .await
            .context("发送版本检查请求失败")?;

        // 只要收到响应就记录检查时间
        if let Err(e) = self
            .store
            .set(LAST_CHECK_KEY, Utc::now().timestamp_millis().to_string())
            .await
        {
            warn!("记录检查时间失败: {e:#}");
        }

        let status = resp.status();
        let text = resp.text().await.context("读取版本检查响应失败")?;
        if !status.is_success() {
            bail!("版本检查失败：状态 {}，响应：{}", status, text);
        }
        serde_json::from_str(&text).context("解析版本检查响应失败")
    }

    /// 下载并安装更新包。
    ///
    /// `update_info` 缺少 `version` 或 `download_url` 时返回错误；其余失败返回 `Ok(false)`。
    pub async fn download_and_install<F>(
        &self,
        update_info: &UpdateInfo,
        on_progress: F,
    ) -> Result<bool, OtaError>
    where
        F: Fn(f64) + Send + Sync,
    {
        let restart = self.config.install_mode == InstallMode::Immediate;
        self.download(update_info, &on_progress, restart).await
    }

    async fn download(
        &self,
        update_info: &UpdateInfo,
        on_progress: &(dyn Fn(f64) + Send + Sync),
        restart: bool,
    ) -> Result<bool, OtaError> {
        let version = update_info
            .version
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or(OtaError::MissingField("version"))?;
        let url = update_info
            .download_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(OtaError::MissingField("downloadUrl"))?;
        if !is_safe_version(version) {
            return Err(OtaError::InvalidVersion(version.to_string()));
        }

        let Some(_guard) = FlagGuard::acquire(&self.downloading) else {
            debug!("已有下载在进行，忽略本次调用");
            return Ok(false);
        };
        self.set_state(OtaState::Downloading);
        info!(version, "开始下载更新包");

        let fetched = match timeout(
            self.config.download_timeout,
            self.fetch_bundle(version, url, update_info.size, on_progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("下载超时 ({:?})", self.config.download_timeout)),
        };

        let installed = match fetched {
            Ok(part) => match self.commit_bundle(&part, update_info.hash.as_deref()).await {
                Ok(bundle_path) => self.install(version, bundle_path).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if installed.is_err() {
            self.discard_partial(version).await;
        }

        match installed {
            Ok(()) => {
                info!(version, "更新包已安装，下次启动时生效");
                if restart {
                    if let Err(e) = self.restart_app() {
                        warn!("重启应用失败: {e:#}");
                    }
                }
                Ok(true)
            }
            Err(e) => {
                error!(version, "下载或安装更新包失败: {e:#}");
                self.set_state(OtaState::Idle);
                Ok(false)
            }
        }
    }

    async fn fetch_bundle(
        &self,
        version: &str,
        url: &str,
        expected_size: Option<u64>,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<PathBuf> {
        let dir = self.cache.version_dir(version);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建版本目录 '{}' 失败", dir.display()))?;
        let part_path = dir.join(format!("{}.part", self.host.platform().bundle_file_name()));

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("发送下载请求失败")?;
        if !resp.status().is_success() {
            bail!("下载失败，状态码: {}", resp.status());
        }

        let total = resp.content_length().or(expected_size).filter(|t| *t > 0);
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("创建临时文件 '{}' 失败", part_path.display()))?;

        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("读取下载数据失败")?;
            file.write_all(&chunk).await.context("写入更新包失败")?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                on_progress((written as f64 / total as f64).min(1.0));
            }
        }
        file.flush().await.context("刷新文件缓冲区失败")?;
        drop(file);

        on_progress(1.0);
        debug!(version, bytes = written, "更新包下载完成");
        Ok(part_path)
    }

    /// 校验通过后用 `.part` 文件替换正式文件，返回正式文件路径
    async fn commit_bundle(&self, part: &Path, hash: Option<&str>) -> Result<PathBuf> {
        verify_bundle(part, hash).await?;
        let final_path = part.with_extension("");
        tokio::fs::rename(part, &final_path)
            .await
            .context("重命名更新包失败")?;
        Ok(final_path)
    }

    /// 删除失败下载留下的 `.part` 文件；版本目录为空时一并删除，已安装的文件不受影响
    async fn discard_partial(&self, version: &str) {
        let dir = self.cache.version_dir(version);
        let part = dir.join(format!("{}.part", self.host.platform().bundle_file_name()));
        if let Err(e) = tokio::fs::remove_file(&part).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %part.display(), "删除未完成的更新包失败: {e}");
            }
        }
        // 目录非空时失败，忽略
        let _ = tokio::fs::remove_dir(&dir).await;
    }

    /// 记账：先写 pendingUpdate，再写当前版本，最后同步到原生侧
    async fn install(&self, version: &str, bundle_path: PathBuf) -> Result<()> {
        let pending = PendingUpdate {
            version: version.to_string(),
            path: bundle_path,
            installed_at: Utc::now().timestamp_millis(),
        };
        let record = serde_json::to_string(&pending).context("序列化 pendingUpdate 失败")?;
        self.store.set(PENDING_UPDATE_KEY, record).await?;
        self.set_state(OtaState::Downloaded);

        self.store.set(BUNDLE_VERSION_KEY, version).await?;

        // 本地记录为准，原生侧只尽力同步
        if let Err(e) = self.host.mirror_bundle_version(Some(version)) {
            warn!("同步版本到原生侧失败: {e:#}");
        }
        self.set_state(OtaState::Installed);
        Ok(())
    }

    /// 检查、确认并下载的一体化流程，不会返回错误
    pub async fn sync<P: Prompter>(&self, options: SyncOptions, prompter: &P) -> SyncOutcome {
        let emit = |status: SyncStatus| {
            if let Some(cb) = &options.on_status_change {
                cb(status);
            }
        };
        let progress = |fraction: f64| {
            if let Some(cb) = &options.on_progress {
                cb(fraction);
            }
        };

        emit(SyncStatus::CheckingForUpdate);
        let info = self.check_for_update().await;
        if !info.update_available {
            emit(SyncStatus::UpToDate);
            return SyncOutcome::UpToDate;
        }
        emit(SyncStatus::UpdateAvailable);

        if info.mandatory || !options.show_prompt {
            let restart = info.mandatory || self.config.install_mode == InstallMode::Immediate;
            return self.sync_download(&info, &progress, restart, &emit).await;
        }

        emit(SyncStatus::AwaitingUserAction);
        if !prompter.confirm_update(&info).await {
            info!("用户拒绝了更新");
            emit(SyncStatus::UpdateIgnored);
            return SyncOutcome::Declined;
        }

        match self.sync_download(&info, &progress, false, &emit).await {
            SyncOutcome::Installed { version, .. } => {
                let restarted = match prompter.confirm_restart(&version).await {
                    RestartChoice::Now => match self.restart_app() {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("重启应用失败: {e:#}");
                            false
                        }
                    },
                    RestartChoice::Later => {
                        info!(version, "用户选择稍后重启");
                        false
                    }
                };
                SyncOutcome::Installed { version, restarted }
            }
            other => other,
        }
    }

    async fn sync_download(
        &self,
        info: &UpdateInfo,
        progress: &(dyn Fn(f64) + Send + Sync),
        restart: bool,
        emit: &(dyn Fn(SyncStatus) + Send + Sync),
    ) -> SyncOutcome {
        emit(SyncStatus::Downloading);
        match self.download(info, progress, restart).await {
            Ok(true) => {
                emit(SyncStatus::UpdateInstalled);
                SyncOutcome::Installed {
                    version: info.version.clone().unwrap_or_default(),
                    restarted: restart,
                }
            }
            Ok(false) => {
                emit(SyncStatus::Error);
                SyncOutcome::Failed
            }
            Err(e) => {
                error!("服务端返回的更新信息无效: {e}");
                emit(SyncStatus::Error);
                SyncOutcome::Failed
            }
        }
    }

    /// 清除所有 OTA 记录与缓存，回到内置 bundle
    pub async fn rollback(&self) -> Result<()> {
        self.store
            .remove(&[BUNDLE_VERSION_KEY, PENDING_UPDATE_KEY, LAST_CHECK_KEY])
            .await
            .context("清除 OTA 记录失败")?;
        if let Err(e) = self.host.mirror_bundle_version(None) {
            warn!("清除原生侧版本记录失败: {e:#}");
        }
        self.cache.clear().await?;
        self.set_state(OtaState::Idle);
        info!("已回滚到内置 bundle");
        Ok(())
    }

    /// 只保留当前版本的缓存目录，返回删除的版本
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        let current = self.get_current_bundle_version().await;
        let removed = self.cache.retain_only(&current).await?;

        if let Some(pending) = self.get_pending_update().await {
            if !pending.path.exists() {
                debug!(version = pending.version, "pendingUpdate 指向的文件已删除，清除记录");
                self.store.remove(&[PENDING_UPDATE_KEY]).await?;
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "已清理旧版本缓存");
        }
        Ok(removed)
    }

    /// 优先使用原生重启，失败或不支持时使用通用重新加载
    pub fn restart_app(&self) -> Result<()> {
        if self.host.supports_native_restart() {
            match self.host.native_restart() {
                Ok(()) => return Ok(()),
                Err(e) => warn!("原生重启失败，改用重新加载: {e:#}"),
            }
        }
        self.host.reload()
    }

    /// 启动时调用：以本地记录为准重新同步原生侧
    pub async fn reconcile_native_mirror(&self) -> Result<()> {
        let version = self.store.get(BUNDLE_VERSION_KEY).await;
        self.host.mirror_bundle_version(version.as_deref())
    }

    pub async fn get_status(&self) -> OtaStatus {
        let pending_update = self.get_pending_update().await;
        OtaStatus {
            current_version: self.get_current_bundle_version().await,
            last_check: self.last_check().await,
            has_pending_update: pending_update.is_some(),
            pending_update,
            app_version: self.host.app_version(),
            device_id: self.host.device_id(),
            platform: self.host.platform(),
            state: self.state(),
        }
    }
}

/// 服务端提供了哈希时必须匹配；未提供时放行并告警
async fn verify_bundle(path: &Path, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected.filter(|h| !h.trim().is_empty()) else {
        warn!(path = %path.display(), "服务端未提供哈希，跳过完整性校验");
        return Ok(());
    };

    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || calc_sha256(&owned))
        .await
        .context("内部错误: 哈希计算任务异常退出")??;

    if !digest_eq(&actual, expected) {
        bail!("更新包哈希不匹配 (期望 {expected}，实际 {actual})");
    }
    debug!("更新包哈希校验通过");
    Ok(())
}
