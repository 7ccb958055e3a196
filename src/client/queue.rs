// 上传队列
//
// 复用任务状态机的设计模式：入队 -> 上传中 -> 完成/失败
// 队列保持入队顺序，批次选择按声明顺序遍历

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 队列文件状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueuedFileStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Error,
}

/// 队列中的文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFile {
    /// 客户端生成的文件标识（与服务端暂存标识无关）
    pub id: String,
    /// 本地文件路径
    pub path: PathBuf,
    /// 显示文件名
    pub filename: String,
    /// MIME 类型提示
    pub filetype: String,
    /// 文件大小
    pub size: u64,
    /// 分片数（由分片策略标注）
    pub parts: u32,
    /// 状态
    pub status: QueuedFileStatus,
    /// 进度百分比 [0,100]
    pub progress: u8,
    /// 已上传字节数
    pub uploaded_bytes: u64,
    /// 错误信息
    pub error: Option<String>,
}

impl QueuedFile {
    /// 创建队列文件
    pub fn new(path: PathBuf, size: u64, parts: u32) -> Self {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let filetype = guess_filetype(&path);
        Self {
            id: Uuid::new_v4().to_string(),
            path,
            filename,
            filetype,
            size,
            parts,
            status: QueuedFileStatus::Pending,
            progress: 0,
            uploaded_bytes: 0,
            error: None,
        }
    }
}

/// 根据扩展名猜测 MIME 类型（引擎不解释，仅作提示透传）
fn guess_filetype(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// 上传队列
#[derive(Debug, Default)]
pub struct UploadQueue {
    files: Mutex<Vec<QueuedFile>>,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，返回客户端文件标识
    pub fn enqueue(&self, path: PathBuf, size: u64, parts: u32) -> String {
        let file = QueuedFile::new(path, size, parts);
        let id = file.id.clone();
        self.files.lock().push(file);
        id
    }

    /// 队列快照
    pub fn snapshot(&self) -> Vec<QueuedFile> {
        self.files.lock().clone()
    }

    /// 按声明顺序取前 limit 个等待中的文件
    pub fn pending(&self, limit: usize) -> Vec<QueuedFile> {
        self.files
            .lock()
            .iter()
            .filter(|f| f.status == QueuedFileStatus::Pending)
            .take(limit)
            .cloned()
            .collect()
    }

    /// 是否还有等待中的文件
    pub fn has_pending(&self) -> bool {
        self.files
            .lock()
            .iter()
            .any(|f| f.status == QueuedFileStatus::Pending)
    }

    /// 查找文件
    pub fn get(&self, id: &str) -> Option<QueuedFile> {
        self.files.lock().iter().find(|f| f.id == id).cloned()
    }

    /// 标记上传中
    pub fn set_uploading(&self, id: &str) {
        let mut files = self.files.lock();
        if let Some(file) = files.iter_mut().find(|f| f.id == id) {
            file.status = QueuedFileStatus::Uploading;
        }
    }

    /// 更新进度
    pub fn update_progress(&self, id: &str, uploaded_bytes: u64, progress: u8) {
        let mut files = self.files.lock();
        if let Some(file) = files.iter_mut().find(|f| f.id == id) {
            file.uploaded_bytes = uploaded_bytes;
            file.progress = progress;
        }
    }

    /// 标记完成
    pub fn complete(&self, id: &str) {
        let mut files = self.files.lock();
        if let Some(file) = files.iter_mut().find(|f| f.id == id) {
            file.status = QueuedFileStatus::Completed;
            file.progress = 100;
            file.uploaded_bytes = file.size;
        }
    }

    /// 标记失败
    pub fn fail(&self, id: &str, error: String) {
        let mut files = self.files.lock();
        if let Some(file) = files.iter_mut().find(|f| f.id == id) {
            file.status = QueuedFileStatus::Error;
            file.error = Some(error);
        }
    }

    /// 移除文件（调用方负责取消其会话）
    pub fn remove(&self, id: &str) -> Option<QueuedFile> {
        let mut files = self.files.lock();
        let index = files.iter().position(|f| f.id == id)?;
        Some(files.remove(index))
    }

    /// 清空已完成文件，不影响其他状态
    pub fn clear_completed(&self) -> usize {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|f| f.status != QueuedFileStatus::Completed);
        before - files.len()
    }

    /// 清空等待中文件，不影响上传中文件
    pub fn clear_pending(&self) -> usize {
        let mut files = self.files.lock();
        let before = files.len();
        files.retain(|f| f.status != QueuedFileStatus::Pending);
        before - files.len()
    }
}
