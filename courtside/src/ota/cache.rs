use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 本地 OTA 包缓存，每个版本一个子目录
pub struct BundleCache {
    root: PathBuf,
}

impl BundleCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("创建缓存目录 '{}' 失败", self.root.display()))
    }

    /// 缓存中现有的版本目录名
    pub async fn versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => {
                return Err(e).with_context(|| format!("读取缓存目录 '{}' 失败", self.root.display()));
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// 删除整个缓存并重新创建空目录
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("删除缓存目录 '{}' 失败", self.root.display()));
            }
        }
        self.ensure().await
    }

    pub async fn remove_version(&self, version: &str) -> Result<()> {
        let dir = self.version_dir(version);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除版本目录 '{}' 失败", dir.display())),
        }
    }

    /// 只保留 `keep` 对应的版本目录，返回被删除的版本
    pub async fn retain_only(&self, keep: &str) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for version in self.versions().await? {
            if version == keep {
                continue;
            }
            match self.remove_version(&version).await {
                Ok(()) => {
                    debug!(version, "已删除旧版本缓存");
                    removed.push(version);
                }
                Err(e) => warn!(version, "删除旧版本缓存失败: {e:#}"),
            }
        }
        Ok(removed)
    }
}

/// 版本号会被用作目录名，拒绝路径分隔符与 `..`
pub fn is_safe_version(version: &str) -> bool {
    !version.is_empty()
        && version != "."
        && version != ".."
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
}
