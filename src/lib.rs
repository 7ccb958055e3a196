// TUS Upload Rust Library
// TUS 1.0.0 断点续传服务核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// TUS 协议常量与元数据编解码
pub mod tus;

// 路径与文件名服务
pub mod path;

// 分片策略
pub mod partition;

// 命名与重名策略注册表
pub mod strategy;

// 暂存存储
pub mod staging;

// 分片重组器
pub mod assembler;

// Web服务器模块
pub mod server;

// 客户端上传引擎模块
pub mod client;

// 导出常用类型
pub use assembler::Assembler;
pub use client::{ProgressEvent, QueuedFile, QueuedFileStatus, StreamScheduler, TusClient, UploadQueue};
pub use config::AppConfig;
pub use partition::PartitionPolicy;
pub use path::PathService;
pub use server::{ApiError, ApiResult, AppState};
pub use staging::{StagingStore, UploadInfo};
pub use strategy::StrategyRegistry;
pub use tus::UploadMetadata;
