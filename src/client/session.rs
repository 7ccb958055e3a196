// TUS 会话客户端
//
// 封装单个 TUS 上传的协议往返：
// - POST 创建会话拿到上传地址
// - 按块 PATCH，失败按重试延迟序列退避，HEAD 重新对齐偏移
// - 取消令牌随时中断

use crate::config::ClientConfig;
use crate::tus::{
    encode_upload_metadata, HEADER_TUS_RESUMABLE, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA,
    HEADER_UPLOAD_OFFSET, OFFSET_CONTENT_TYPE, TUS_VERSION,
};
use anyhow::{bail, Context, Result};
use reqwest::Client;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// TUS 会话客户端
#[derive(Debug, Clone)]
pub struct TusClient {
    /// 共享 HTTP 客户端
    http: Client,
    /// 创建会话的端点完整地址
    endpoint_url: String,
    /// PATCH 分块大小
    chunk_size: u64,
    /// 重试延迟序列（毫秒）
    retry_delays: Vec<u64>,
}

impl TusClient {
    /// 创建客户端
    ///
    /// # 参数
    /// * `base_url` - 服务器地址，如 `http://127.0.0.1:8080`
    /// * `config` - 客户端上传配置
    pub fn new(base_url: &str, config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("创建 HTTP 客户端失败")?;
        let endpoint_url = format!("{}{}", base_url.trim_end_matches('/'), config.endpoint);
        Ok(Self {
            http,
            endpoint_url,
            chunk_size: config.chunk_size(),
            retry_delays: config.retry_delays_ms.clone(),
        })
    }

    /// 创建上传会话
    ///
    /// # 返回
    /// 会话的上传地址（Location）
    pub async fn create_session(
        &self,
        upload_length: u64,
        metadata: &[(&str, &str)],
    ) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_LENGTH, upload_length.to_string())
            .header(HEADER_UPLOAD_METADATA, encode_upload_metadata(metadata))
            .send()
            .await
            .context("创建上传会话请求失败")?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            bail!("创建上传会话被拒绝: status={}, body={}", status, body);
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("创建响应缺少 Location")?;

        // Location 可能是相对地址，基于端点解析
        let url = reqwest::Url::parse(&self.endpoint_url)
            .and_then(|base| base.join(location))
            .context("解析上传地址失败")?;

        debug!("上传会话已创建: {}", url);
        Ok(url.to_string())
    }

    /// 查询服务器偏移（断点续传对齐）
    pub async fn head_offset(&self, upload_url: &str) -> Result<u64> {
        let response = self
            .http
            .head(upload_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .send()
            .await
            .context("HEAD 请求失败")?;

        if !response.status().is_success() {
            bail!("HEAD 被拒绝: status={}", response.status());
        }

        response
            .headers()
            .get(HEADER_UPLOAD_OFFSET)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .context("HEAD 响应缺少 Upload-Offset")
    }

    /// 把本地文件的一段字节上传到一个会话
    ///
    /// # 参数
    /// * `range` - 本地文件内的字节区间（会话自身从 0 计偏移）
    /// * `uploaded` - 跨分片共享的已上传字节计数
    /// * `cancel` - 取消令牌
    pub async fn upload_range(
        &self,
        upload_url: &str,
        file_path: &Path,
        range: Range<u64>,
        uploaded: &AtomicU64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = range.end - range.start;
        let mut offset = 0u64;
        let mut retry_index = 0usize;

        while offset < total {
            if cancel.is_cancelled() {
                bail!("上传已取消");
            }

            let chunk_len = (total - offset).min(self.chunk_size);
            let data = read_file_range(file_path, range.start + offset, chunk_len).await?;

            match self.patch_chunk(upload_url, offset, data).await {
                Ok(new_offset) => {
                    uploaded.fetch_add(new_offset.saturating_sub(offset), Ordering::SeqCst);
                    offset = new_offset;
                    retry_index = 0;
                }
                Err(e) => {
                    if retry_index >= self.retry_delays.len() {
                        return Err(e.context(format!(
                            "分块上传失败，已用尽 {} 次重试",
                            self.retry_delays.len()
                        )));
                    }
                    let delay = self.retry_delays[retry_index];
                    retry_index += 1;
                    warn!(
                        "分块上传失败，{}ms 后重试 ({}/{}): {}",
                        delay,
                        retry_index,
                        self.retry_delays.len(),
                        e
                    );
                    if delay > 0 {
                        tokio::select! {
                            _ = cancel.cancelled() => bail!("上传已取消"),
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                    }
                    // 连接中断可能留下部分写入，重新对齐服务器偏移
                    if let Ok(server_offset) = self.head_offset(upload_url).await {
                        if server_offset != offset {
                            debug!("偏移重新对齐: {} -> {}", offset, server_offset);
                            uploaded
                                .fetch_add(server_offset.saturating_sub(offset), Ordering::SeqCst);
                            offset = server_offset;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// 发送一个 PATCH 分块
    ///
    /// # 返回
    /// 服务器确认后的新偏移
    async fn patch_chunk(&self, upload_url: &str, offset: u64, data: Vec<u8>) -> Result<u64> {
        let response = self
            .http
            .patch(upload_url)
            .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
            .header(HEADER_UPLOAD_OFFSET, offset.to_string())
            .header(reqwest::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE)
            .body(data)
            .send()
            .await
            .context("PATCH 请求失败")?;

        let status = response.status();
        if status != reqwest::StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            bail!("PATCH 被拒绝: status={}, body={}", status, body);
        }

        response
            .headers()
            .get(HEADER_UPLOAD_OFFSET)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .context("PATCH 响应缺少 Upload-Offset")
    }
}

/// 读取本地文件的一段字节
async fn read_file_range(path: &Path, start: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("打开上传文件失败: {:?}", path))?;
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .context("文件定位失败")?;

    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer)
        .await
        .context("读取分块数据失败")?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_file_range() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(read_file_range(&path, 0, 4).await.unwrap(), b"0123");
        assert_eq!(read_file_range(&path, 4, 6).await.unwrap(), b"456789");

        // 越界读取报错
        assert!(read_file_range(&path, 8, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_endpoint_url_join() {
        let config = ClientConfig::default();
        let client = TusClient::new("http://127.0.0.1:9000/", &config).unwrap();
        assert_eq!(client.endpoint_url, "http://127.0.0.1:9000/api/upload/");
    }
}
