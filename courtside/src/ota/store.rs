use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// 以 JSON 文件持久化的字符串键值存储。
///
/// 每次写入都先写临时文件再重命名，进程中途退出不会留下半个文件。
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建状态目录 '{}' 失败", parent.display()))?;
        }

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), "状态文件已损坏，将重新创建: {e}");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("读取状态文件 '{}' 失败", path.display()));
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: impl Into<String>) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value.into());
        self.persist(&entries).await
    }

    /// 一次删除多个键，只写一次文件
    pub async fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let mut changed = false;
        for key in keys {
            changed |= entries.remove(*key).is_some();
        }
        if changed {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let body = serde_json::to_vec_pretty(entries).context("序列化状态失败")?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("写入临时状态文件 '{}' 失败", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("替换状态文件 '{}' 失败", self.path.display()))?;
        Ok(())
    }
}
