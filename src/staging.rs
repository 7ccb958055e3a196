// 暂存存储
//
// 每个上传对应两个文件：
// - {staging_dir}/{staging_id}        原始字节，按序追加
// - {staging_dir}/{staging_id}.json   sidecar 元数据，每次追加后重写
//
// sidecar 读改写通过按 staging_id 的锁表串行化；不同 id 之间无锁

use crate::tus::UploadMetadata;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// sidecar 文件扩展名
const SIDECAR_EXTENSION: &str = "json";

/// 上传状态（sidecar 内容）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInfo {
    /// 暂存标识
    pub id: String,
    /// 声明的总大小
    pub size: u64,
    /// 已接收字节数
    pub offset: u64,
    /// 上传元数据
    pub metadata: UploadMetadata,
    /// 创建时间
    pub creation_date: DateTime<Utc>,
}

impl UploadInfo {
    /// 载荷是否完整
    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }
}

/// 暂存存储
#[derive(Debug)]
pub struct StagingStore {
    /// 暂存目录
    dir: PathBuf,
    /// 按 staging_id 的串行化锁表
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StagingStore {
    /// 创建暂存存储，目录不存在时自动创建
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("创建暂存目录失败: {:?}", dir))?;
        Ok(Self {
            dir,
            locks: DashMap::new(),
        })
    }

    /// 暂存目录
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 载荷文件路径
    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// sidecar 文件路径
    pub fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, SIDECAR_EXTENSION))
    }

    /// 获取指定上传的串行化锁
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// 释放锁表项（上传终结后调用）
    pub fn discard_lock(&self, id: &str) {
        self.locks.remove(id);
    }

    /// 创建新上传：空载荷文件 + 初始 sidecar（offset=0）
    pub async fn create(&self, size: u64, metadata: UploadMetadata) -> Result<UploadInfo> {
        let id = Uuid::new_v4().simple().to_string();
        let info = UploadInfo {
            id: id.clone(),
            size,
            offset: 0,
            metadata,
            creation_date: Utc::now(),
        };

        fs::File::create(self.payload_path(&id))
            .await
            .with_context(|| format!("创建载荷文件失败: {}", id))?;
        self.write_info(&info).await?;

        debug!("已创建暂存上传: id={}, size={}", id, size);
        Ok(info)
    }

    /// 读取 sidecar，缺失或损坏时返回 None
    pub async fn load(&self, id: &str) -> Option<UploadInfo> {
        let path = self.sidecar_path(id);
        let content = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("解析 sidecar 失败 {:?}: {}", path, e);
                None
            }
        }
    }

    /// 重写 sidecar
    ///
    /// 先写临时文件再原子重命名，防止写入中断导致文件损坏
    pub async fn write_info(&self, info: &UploadInfo) -> Result<()> {
        let path = self.sidecar_path(&info.id);
        let temp_path = self.dir.join(format!("{}.{}.tmp", info.id, SIDECAR_EXTENSION));

        let content =
            serde_json::to_vec_pretty(info).context("序列化 sidecar 失败")?;
        fs::write(&temp_path, content)
            .await
            .with_context(|| format!("写入 sidecar 临时文件失败: {:?}", temp_path))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("重命名 sidecar 失败: {:?}", path))?;

        Ok(())
    }

    /// 将请求体流追加到载荷文件末尾
    ///
    /// # 返回
    /// 实际写入的字节数
    pub async fn append_body<S>(&self, id: &str, mut stream: S) -> Result<u64>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let path = self.payload_path(id);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("打开载荷文件失败: {:?}", path))?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("读取请求体失败")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("追加载荷失败: {}", id))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .with_context(|| format!("刷新载荷文件失败: {}", id))?;

        Ok(written)
    }

    /// 删除上传的载荷与 sidecar（缺失的文件忽略）
    pub async fn delete(&self, id: &str) -> Result<()> {
        for path in [self.payload_path(id), self.sidecar_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("删除暂存文件失败: {:?}", path)))
                }
            }
        }
        self.discard_lock(id);
        debug!("已删除暂存上传: id={}", id);
        Ok(())
    }

    /// 扫描暂存目录下所有 sidecar
    ///
    /// 损坏的 sidecar 跳过并告警，用于启动时重建分片组状态
    pub async fn scan(&self) -> Result<Vec<UploadInfo>> {
        let mut infos = Vec::new();
        let mut skipped = 0;

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("读取暂存目录失败: {:?}", self.dir))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != SIDECAR_EXTENSION) {
                continue;
            }

            let content = match fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("读取 sidecar 失败 {:?}: {}", path, e);
                    skipped += 1;
                    continue;
                }
            };
            match serde_json::from_slice::<UploadInfo>(&content) {
                Ok(info) => infos.push(info),
                Err(e) => {
                    warn!("跳过无效 sidecar {:?}: {}", path, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("暂存目录扫描完成，跳过 {} 个无效 sidecar", skipped);
        }
        debug!("扫描到 {} 个暂存上传", infos.len());

        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = std::io::Result<Bytes>> + Unpin {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let temp = TempDir::new().unwrap();
        let store = StagingStore::new(temp.path().to_path_buf()).unwrap();

        let info = store.create(11, UploadMetadata::default()).await.unwrap();
        assert_eq!(info.offset, 0);
        assert_eq!(info.size, 11);
        assert!(!info.is_complete());
        assert!(store.payload_path(&info.id).exists());

        let loaded = store.load(&info.id).await.unwrap();
        assert_eq!(loaded.id, info.id);
        assert_eq!(loaded.offset, 0);
        assert_eq!(loaded.size, 11);
    }

    #[tokio::test]
    async fn test_load_missing() {
        let temp = TempDir::new().unwrap();
        let store = StagingStore::new(temp.path().to_path_buf()).unwrap();

        assert!(store.load("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_append_and_rewrite() {
        let temp = TempDir::new().unwrap();
        let store = StagingStore::new(temp.path().to_path_buf()).unwrap();

        let mut info = store.create(11, UploadMetadata::default()).await.unwrap();

        let written = store
            .append_body(&info.id, body(&[b"hello", b" "]))
            .await
            .unwrap();
        assert_eq!(written, 6);

        info.offset += written;
        store.write_info(&info).await.unwrap();

        let written = store.append_body(&info.id, body(&[b"world"])).await.unwrap();
        assert_eq!(written, 5);

        info.offset += written;
        store.write_info(&info).await.unwrap();

        assert!(info.is_complete());
        let payload = std::fs::read(store.payload_path(&info.id)).unwrap();
        assert_eq!(payload, b"hello world");

        let loaded = store.load(&info.id).await.unwrap();
        assert_eq!(loaded.offset, 11);
    }

    #[tokio::test]
    async fn test_delete() {
        let temp = TempDir::new().unwrap();
        let store = StagingStore::new(temp.path().to_path_buf()).unwrap();

        let info = store.create(5, UploadMetadata::default()).await.unwrap();
        store.delete(&info.id).await.unwrap();

        assert!(!store.payload_path(&info.id).exists());
        assert!(!store.sidecar_path(&info.id).exists());

        // 重复删除不报错
        store.delete(&info.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_skips_invalid() {
        let temp = TempDir::new().unwrap();
        let store = StagingStore::new(temp.path().to_path_buf()).unwrap();

        store.create(1, UploadMetadata::default()).await.unwrap();
        store.create(2, UploadMetadata::default()).await.unwrap();
        std::fs::write(temp.path().join("broken.json"), b"not json").unwrap();

        let infos = store.scan().await.unwrap();
        assert_eq!(infos.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_serializes_per_id() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(StagingStore::new(temp.path().to_path_buf()).unwrap());

        let info = store.create(4, UploadMetadata::default()).await.unwrap();

        let guard = store.lock(&info.id).await;
        // 不同 id 的锁互不阻塞
        let other = store.create(4, UploadMetadata::default()).await.unwrap();
        let _other_guard = store.lock(&other.id).await;
        drop(guard);

        // 释放后可再次获取
        let _again = store.lock(&info.id).await;
    }
}
