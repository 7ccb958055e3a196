// 应用状态

use crate::assembler::Assembler;
use crate::config::AppConfig;
use crate::path::PathService;
use crate::staging::StagingStore;
use crate::strategy::StrategyRegistry;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 暂存存储
    pub staging: Arc<StagingStore>,
    /// 路径与文件名服务
    pub paths: Arc<PathService>,
    /// 策略注册表
    pub strategies: Arc<StrategyRegistry>,
    /// 分片重组器
    pub assembler: Arc<Assembler>,
}

impl AppState {
    /// 创建应用状态并完成启动期准备
    ///
    /// 暂存目录扫描：重建分片组状态，并对滞留过久的暂存条目告警
    pub async fn new(config: AppConfig) -> Result<Self> {
        let staging = Arc::new(StagingStore::new(config.storage.staging_dir.clone())?);
        let paths = Arc::new(PathService::new(
            config.storage.mount_path.clone(),
            &config.storage.sanitize_pattern,
        )?);
        let strategies = Arc::new(StrategyRegistry::with_builtins(paths.clone()));
        let assembler = Arc::new(Assembler::new(
            staging.clone(),
            paths.clone(),
            strategies.clone(),
        ));

        let state = Self {
            config: Arc::new(config),
            staging,
            paths,
            strategies,
            assembler,
        };

        let restored = state.assembler.rehydrate().await?;
        if restored > 0 {
            info!("启动重建完成: {} 个分片记录", restored);
        }
        state.warn_stale_uploads().await;

        Ok(state)
    }

    /// 对滞留超过阈值的暂存条目告警（不删除，留给运维处理）
    async fn warn_stale_uploads(&self) {
        let threshold = chrono::Duration::days(self.config.storage.stale_warn_days as i64);
        let now = chrono::Utc::now();

        let infos = match self.staging.scan().await {
            Ok(infos) => infos,
            Err(e) => {
                warn!("暂存目录扫描失败: {}", e);
                return;
            }
        };

        for info in infos {
            if now.signed_duration_since(info.creation_date) > threshold {
                warn!(
                    "暂存条目滞留超过 {} 天: id={}, offset={}/{}, 创建于 {}",
                    self.config.storage.stale_warn_days,
                    info.id,
                    info.offset,
                    info.size,
                    info.creation_date
                );
            }
        }
    }
}
