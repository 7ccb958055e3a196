// 上传流调度器
//
// 驱动循环（单任务协作式）：
// 1. 从队列取等待文件，按分片数做背包选择填满流预算
// 2. 批内文件并行上传：单分片文件一个 TUS 会话，多分片文件
//    切成等长切片（末片短），每片一个会话并行发出
// 3. 等整批落定（全部成功或失败）再重新规划
// 4. 让出时隙吸纳新入队文件，循环
//
// 失败只标记所属文件；同组分片的首个失败会短路其余分片

use crate::client::queue::{QueuedFile, QueuedFileStatus, UploadQueue};
use crate::client::selection::select_batch;
use crate::client::session::TusClient;
use crate::client::throttle::ProgressThrottler;
use crate::config::ClientConfig;
use crate::partition::PartitionPolicy;
use anyhow::Result;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 进度事件
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// 客户端文件标识
    pub file_id: String,
    /// 文件状态
    pub status: QueuedFileStatus,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 进度百分比
    pub progress: u8,
}

/// 上传流调度器
pub struct StreamScheduler {
    queue: Arc<UploadQueue>,
    tus: Arc<TusClient>,
    config: ClientConfig,
    partition: PartitionPolicy,
    /// 会话句柄（{fileId} 或 {fileId}-{partIndex} -> 取消令牌）
    sessions: Arc<DashMap<String, CancellationToken>>,
    /// 进度事件通道（可选）
    progress_tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl StreamScheduler {
    /// 创建调度器
    ///
    /// # 参数
    /// * `base_url` - 服务器地址，如 `http://127.0.0.1:8080`
    pub fn new(
        base_url: &str,
        config: ClientConfig,
        partition: PartitionPolicy,
    ) -> Result<Self> {
        let tus = Arc::new(TusClient::new(base_url, &config)?);
        Ok(Self {
            queue: Arc::new(UploadQueue::new()),
            tus,
            config,
            partition,
            sessions: Arc::new(DashMap::new()),
            progress_tx: None,
        })
    }

    /// 挂接进度事件通道
    pub fn with_progress_channel(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// 上传队列
    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    /// 入队一个本地文件，按分片策略标注分片数
    pub fn enqueue(&self, path: PathBuf, size: u64) -> String {
        let parts = self.partition.part_count(size);
        let id = self.queue.enqueue(path, size, parts);
        debug!("文件入队: id={}, size={}, 分片数={}", id, size, parts);
        id
    }

    /// 移除文件并取消其全部在途会话
    pub fn remove_file(&self, file_id: &str) -> Option<QueuedFile> {
        let prefix = format!("{}-", file_id);
        for entry in self.sessions.iter() {
            if entry.key() == file_id || entry.key().starts_with(&prefix) {
                entry.value().cancel();
            }
        }
        self.discard_sessions(file_id);
        info!("文件已移除: id={}", file_id);
        self.queue.remove(file_id)
    }

    /// 清空已完成文件（不影响上传中）
    pub fn clear_completed(&self) -> usize {
        self.queue.clear_completed()
    }

    /// 清空等待中文件（不影响上传中）
    pub fn clear_pending(&self) -> usize {
        self.queue.clear_pending()
    }

    /// 驱动循环：队列清空前持续选批上传
    pub async fn run(&self) {
        info!(
            "上传调度循环启动: 流预算={}, 单轮选择上限={}",
            self.config.max_stream_count, self.config.max_file_selection
        );

        loop {
            let pending = self.queue.pending(self.config.max_file_selection);
            if pending.is_empty() {
                break;
            }

            let candidates: Vec<(String, u32)> =
                pending.iter().map(|f| (f.id.clone(), f.parts)).collect();
            let mut batch = select_batch(&candidates, self.config.max_stream_count);
            if batch.is_empty() {
                // 首个文件分片数超过预算也要放行，保证超大文件能前进
                warn!(
                    "文件 {} 的 {} 个分片超过流预算 {}，强制单独放行",
                    pending[0].filename, pending[0].parts, self.config.max_stream_count
                );
                batch.push(pending[0].id.clone());
            }

            debug!("本轮批次: {} 个文件", batch.len());

            // 批次屏障：整批落定才重新规划
            let uploads = batch
                .into_iter()
                .filter_map(|id| self.queue.get(&id))
                .map(|file| self.upload_file(file));
            futures::future::join_all(uploads).await;

            // 让出时隙，吸纳运行期间新入队的文件
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("上传调度循环结束：队列无等待文件");
    }

    /// 上传一个文件（单体或分片组），落定后更新状态
    async fn upload_file(&self, file: QueuedFile) {
        info!(
            "开始上传: {} ({} bytes, {} 分片)",
            file.filename, file.size, file.parts
        );
        self.queue.set_uploading(&file.id);
        self.emit(&file.id, QueuedFileStatus::Uploading, 0, 0);

        let uploaded = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();
        self.sessions.insert(file.id.clone(), token.clone());

        // 进度监视：节流后写回队列并发布事件
        let monitor_stop = CancellationToken::new();
        let monitor = self.spawn_progress_monitor(&file, uploaded.clone(), monitor_stop.clone());

        let result = if file.parts <= 1 {
            self.upload_solo(&file, &uploaded, &token).await
        } else {
            self.upload_multipart(&file, &uploaded, &token).await
        };

        monitor_stop.cancel();
        let _ = monitor.await;

        match result {
            Ok(()) => {
                self.queue.complete(&file.id);
                self.emit(&file.id, QueuedFileStatus::Completed, file.size, 100);
                info!("上传完成: {}", file.filename);
            }
            Err(e) => {
                error!("上传失败: {}: {:#}", file.filename, e);
                self.queue.fail(&file.id, e.to_string());
                let bytes = uploaded.load(Ordering::SeqCst);
                let progress = progress_percent(bytes, file.size);
                self.emit(&file.id, QueuedFileStatus::Error, bytes, progress);
            }
        }

        self.discard_sessions(&file.id);
    }

    /// 单体上传：一个会话覆盖整个文件
    async fn upload_solo(
        &self,
        file: &QueuedFile,
        uploaded: &Arc<AtomicU64>,
        token: &CancellationToken,
    ) -> Result<()> {
        let pairs = self.base_metadata(file);
        let refs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

        let upload_url = self.tus.create_session(file.size, &refs).await?;
        self.tus
            .upload_range(&upload_url, &file.path, 0..file.size, uploaded, token)
            .await
    }

    /// 分片上传：等长切片（末片短），每片一个会话并行发出
    async fn upload_multipart(
        &self,
        file: &QueuedFile,
        uploaded: &Arc<AtomicU64>,
        token: &CancellationToken,
    ) -> Result<()> {
        // 每个逻辑文件一个新的组标识
        let multipart_id = Uuid::new_v4().to_string();
        let part_size = file.size.div_ceil(file.parts as u64);
        let first_error: Arc<parking_lot::Mutex<Option<anyhow::Error>>> =
            Arc::new(parking_lot::Mutex::new(None));

        debug!(
            "分片上传: {} -> multipart_id={}, 切片大小={}",
            file.filename, multipart_id, part_size
        );

        let mut part_futures = Vec::new();
        for index in 1..=file.parts {
            let start = (index as u64 - 1) * part_size;
            let end = (start + part_size).min(file.size);

            let part_token = token.child_token();
            self.sessions
                .insert(format!("{}-{}", file.id, index), part_token.clone());

            let tus = self.tus.clone();
            let path = file.path.clone();
            let uploaded = uploaded.clone();
            let group_token = token.clone();
            let first_error = first_error.clone();
            let mut pairs = self.base_metadata(file);
            pairs.push(("multipartId".to_string(), multipart_id.clone()));
            pairs.push(("partIndex".to_string(), index.to_string()));
            pairs.push(("totalParts".to_string(), file.parts.to_string()));
            pairs.push(("originalFileSize".to_string(), file.size.to_string()));

            part_futures.push(async move {
                let refs: Vec<(&str, &str)> =
                    pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                let result = async {
                    let url = tus.create_session(end - start, &refs).await?;
                    tus.upload_range(&url, &path, start..end, &uploaded, &part_token)
                        .await
                }
                .await;

                if let Err(e) = result {
                    // 只保留首个失败，短路其余兄弟分片；后续落定忽略
                    let mut slot = first_error.lock();
                    if slot.is_none() {
                        *slot = Some(e.context(format!("{} 号分片上传失败", index)));
                        group_token.cancel();
                    } else {
                        debug!("{} 号分片在组取消后落定", index);
                    }
                }
            });
        }

        futures::future::join_all(part_futures).await;

        let result = first_error.lock().take();
        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 每个会话固定携带的元数据
    fn base_metadata(&self, file: &QueuedFile) -> Vec<(String, String)> {
        vec![
            ("filename".to_string(), file.filename.clone()),
            ("filetype".to_string(), file.filetype.clone()),
            ("withFilename".to_string(), self.config.with_filename.clone()),
            ("onDuplicate".to_string(), self.config.on_duplicate.clone()),
            (
                "destinationPath".to_string(),
                self.config.destination_path.clone(),
            ),
        ]
    }

    /// 启动进度监视任务
    fn spawn_progress_monitor(
        &self,
        file: &QueuedFile,
        uploaded: Arc<AtomicU64>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let tx = self.progress_tx.clone();
        let file_id = file.id.clone();
        let size = file.size;

        tokio::spawn(async move {
            let throttler = ProgressThrottler::default();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                if throttler.should_emit() {
                    let bytes = uploaded.load(Ordering::SeqCst);
                    let progress = progress_percent(bytes, size);
                    queue.update_progress(&file_id, bytes, progress);
                    if let Some(tx) = &tx {
                        let _ = tx.send(ProgressEvent {
                            file_id: file_id.clone(),
                            status: QueuedFileStatus::Uploading,
                            uploaded_bytes: bytes,
                            progress,
                        });
                    }
                }
            }
        })
    }

    /// 发布进度事件
    fn emit(&self, file_id: &str, status: QueuedFileStatus, uploaded_bytes: u64, progress: u8) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(ProgressEvent {
                file_id: file_id.to_string(),
                status,
                uploaded_bytes,
                progress,
            });
        }
    }

    /// 丢弃一个文件的全部会话句柄
    fn discard_sessions(&self, file_id: &str) {
        let prefix = format!("{}-", file_id);
        self.sessions
            .retain(|key, _| key != file_id && !key.starts_with(&prefix));
    }
}

/// 进度百分比，全部落定前最高显示 99%
fn progress_percent(uploaded: u64, size: u64) -> u8 {
    if size == 0 {
        return 99;
    }
    (uploaded * 100 / size).min(99) as u8
}
