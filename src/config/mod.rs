// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 暂存与落盘配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 分片策略配置
    #[serde(default)]
    pub partition: PartitionConfig,
    /// 客户端上传配置
    #[serde(default)]
    pub client: ClientConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// CORS允许的源（空表示允许所有）
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: vec![],
        }
    }
}

/// 暂存与落盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 暂存目录（环境变量 STAGING_DIR 可覆盖）
    pub staging_dir: PathBuf,
    /// 最终落盘挂载根目录（环境变量 MOUNT_PATH 可覆盖）
    pub mount_path: PathBuf,
    /// 单文件大小上限 (GB)
    pub max_file_size_gb: u64,
    /// 文件名非法字符模式（匹配到的字节替换为 `_`）
    pub sanitize_pattern: String,
    /// 暂存残留告警阈值（天），启动时仅告警不删除
    pub stale_warn_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("./staging"),
            mount_path: PathBuf::from("./uploads"),
            max_file_size_gb: 20,
            sanitize_pattern: "[^A-Za-z0-9._-]".to_string(),
            stale_warn_days: 7,
        }
    }
}

impl StorageConfig {
    /// 单文件大小上限（字节）
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_gb * 1024 * 1024 * 1024
    }
}

/// 分片策略配置
///
/// 阈值与实现保持一致（512MB 单分片、最多 8 分片），可按部署调整
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// 单分片大小 (MB)
    pub part_size_mb: u64,
    /// 最大分片数
    pub max_parts: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            part_size_mb: 512,
            max_parts: 8,
        }
    }
}

/// 客户端上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// TUS 服务端点
    pub endpoint: String,
    /// PATCH 分块大小 (MB)
    pub chunk_size_mb: u64,
    /// 重试延迟序列（毫秒）
    pub retry_delays_ms: Vec<u64>,
    /// 单轮最多参与选择的文件数
    pub max_file_selection: usize,
    /// 最大并发流数（所有文件的分片共享）
    pub max_stream_count: u32,
    /// 默认命名策略
    pub with_filename: String,
    /// 默认重名策略
    pub on_duplicate: String,
    /// 默认目标子目录
    pub destination_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/upload/".to_string(),
            chunk_size_mb: 8,
            retry_delays_ms: vec![0, 1000, 3000, 5000],
            max_file_selection: 60,
            max_stream_count: 8,
            with_filename: "original".to_string(),
            on_duplicate: "prevent".to_string(),
            destination_path: String::new(),
        }
    }
}

impl ClientConfig {
    /// PATCH 分块大小（字节）
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    pub enabled: bool,
    /// 日志目录
    pub log_dir: PathBuf,
    /// 日志级别
    pub level: String,
    /// 日志保留天数
    pub retention_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            retention_days: 7,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置，失败时回退默认配置
    ///
    /// 环境变量 STAGING_DIR / MOUNT_PATH 优先于配置文件
    pub async fn load_or_default(path: &str) -> Self {
        let mut config = match Self::load(path).await {
            Ok(config) => {
                tracing::info!("已加载配置文件: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("加载配置文件失败（{}），使用默认配置: {}", path, e);
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// 从文件加载配置
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {}", path))?;
        Ok(config)
    }

    /// 应用环境变量覆盖
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STAGING_DIR") {
            if !dir.is_empty() {
                self.storage.staging_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("MOUNT_PATH") {
            if !dir.is_empty() {
                self.storage.mount_path = PathBuf::from(dir);
            }
        }
    }
}
