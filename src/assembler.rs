// 分片重组器
//
// 按 multipartId 归集同组分片，最后一个分片完成时触发重组：
// 以 1 号分片的载荷为基底，按序号顺序追加其余分片，重组完成后
// 走单体上传的落盘路径
//
// 组状态仅存于进程内存；记录分片与"是否最后一个"的判定按
// multipartId 原子执行，组条目在重组前被摘除，成功或失败都只触发一次

use crate::path::PathService;
use crate::staging::{StagingStore, UploadInfo};
use crate::strategy::StrategyRegistry;
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// 一个分片组的归集状态
#[derive(Debug)]
struct Assembly {
    /// 组内序号 -> 暂存标识
    parts: HashMap<u32, String>,
    /// 组大小
    total_parts: u32,
    /// 组元数据（取自任一分片，组内一致）
    metadata: crate::tus::UploadMetadata,
}

/// 分片重组器
pub struct Assembler {
    /// 活跃分片组（multipartId -> Assembly）
    assemblies: DashMap<String, Assembly>,
    staging: Arc<StagingStore>,
    paths: Arc<PathService>,
    strategies: Arc<StrategyRegistry>,
}

impl Assembler {
    /// 创建重组器
    pub fn new(
        staging: Arc<StagingStore>,
        paths: Arc<PathService>,
        strategies: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            assemblies: DashMap::new(),
            staging,
            paths,
            strategies,
        }
    }

    /// 终结一个已收满字节的上传
    ///
    /// # 返回
    /// 整个逻辑文件是否就此完成（分片组成员在组未收齐时返回 false）
    pub async fn finalize(&self, info: &UploadInfo) -> Result<bool> {
        if info.metadata.is_multipart_part() {
            self.handle_part_completion(info).await
        } else {
            self.finalize_solo(info).await?;
            Ok(true)
        }
    }

    /// 记录一个分片完成，收齐后触发重组
    async fn handle_part_completion(&self, info: &UploadInfo) -> Result<bool> {
        let multipart_id = info
            .metadata
            .multipart_id
            .clone()
            .context("分片缺少 multipartId")?;
        let part_index = info.metadata.part_index().context("分片序号无效")?;
        let total_parts = info.metadata.total_parts().context("分片组大小无效")?;
        if part_index == 0 || part_index > total_parts {
            anyhow::bail!("分片序号越界: {}/{}", part_index, total_parts);
        }

        // 记录分片并判定是否收齐；entry 守卫保证按组原子
        let complete = {
            let mut assembly = self
                .assemblies
                .entry(multipart_id.clone())
                .or_insert_with(|| {
                    debug!("创建分片组: multipart_id={}, 分片数={}", multipart_id, total_parts);
                    Assembly {
                        parts: HashMap::new(),
                        total_parts,
                        metadata: info.metadata.clone(),
                    }
                });
            assembly.parts.insert(part_index, info.id.clone());
            assembly.parts.len() as u32 >= assembly.total_parts
        };

        if !complete {
            debug!(
                "分片 {}/{} 已记录: multipart_id={}",
                part_index, total_parts, multipart_id
            );
            return Ok(false);
        }

        // 摘除组条目；并发的收尾分片只有一个能摘到，组不会重复重组
        let Some((_, assembly)) = self.assemblies.remove(&multipart_id) else {
            debug!("分片组 {} 已由其他分片触发重组，跳过", multipart_id);
            return Ok(false);
        };

        info!(
            "分片组 {} 已收齐 {} 个分片，开始重组",
            multipart_id, assembly.total_parts
        );

        if let Err(e) = self.reassemble(&multipart_id, assembly).await {
            error!("分片组 {} 重组失败: {}", multipart_id, e);
            return Err(e);
        }
        Ok(true)
    }

    /// 重组分片组
    ///
    /// 1 号分片的载荷为基底，2..N 按序号流式追加后删除；
    /// 基底 sidecar 重写为完成态的单体上传后走落盘路径。
    /// 任何失败都已在调用方摘除组条目，已追加的字节留在磁盘待人工清理
    async fn reassemble(&self, multipart_id: &str, assembly: Assembly) -> Result<()> {
        let base_id = assembly
            .parts
            .get(&1)
            .cloned()
            .with_context(|| format!("分片组 {} 缺少 1 号分片", multipart_id))?;

        let base_info = self
            .staging
            .load(&base_id)
            .await
            .with_context(|| format!("分片组 {} 的基底 sidecar 缺失", multipart_id))?;

        let mut base_file = OpenOptions::new()
            .append(true)
            .open(self.staging.payload_path(&base_id))
            .await
            .with_context(|| format!("打开基底载荷失败: {}", base_id))?;

        for index in 2..=assembly.total_parts {
            let part_id = assembly
                .parts
                .get(&index)
                .with_context(|| format!("分片组 {} 缺少 {} 号分片", multipart_id, index))?;

            let mut part_file = File::open(self.staging.payload_path(part_id))
                .await
                .with_context(|| format!("打开分片载荷失败: {}", part_id))?;
            let copied = tokio::io::copy(&mut part_file, &mut base_file)
                .await
                .with_context(|| format!("追加分片 {} 到基底失败", index))?;
            drop(part_file);

            self.staging.delete(part_id).await?;
            debug!(
                "分片 {}/{} 已并入基底: {} bytes",
                index, assembly.total_parts, copied
            );
        }

        base_file.flush().await.context("刷新基底载荷失败")?;
        drop(base_file);

        // 权威大小来自 originalFileSize；缺失时取重组后的实际大小
        let size = match assembly.metadata.original_file_size() {
            Some(size) => size,
            None => {
                tokio::fs::metadata(self.staging.payload_path(&base_id))
                    .await
                    .context("读取基底载荷大小失败")?
                    .len()
            }
        };

        // 从这里开始基底等同于一个已完成的单体上传
        let synthesized = UploadInfo {
            id: base_id.clone(),
            size,
            offset: size,
            metadata: assembly.metadata,
            creation_date: base_info.creation_date,
        };
        self.staging.write_info(&synthesized).await?;

        self.finalize_solo(&synthesized).await?;

        info!(
            "分片组 {} 重组完成: size={} bytes, 基底={}",
            multipart_id, size, base_id
        );
        Ok(())
    }

    /// 单体上传落盘
    ///
    /// 计算最终文件名并移动载荷；sidecar 按命名策略保留在目标旁或删除
    pub async fn finalize_solo(&self, info: &UploadInfo) -> Result<()> {
        let final_name = self.strategies.final_filename(&info.metadata, &info.id);
        let dest = self
            .paths
            .full_path(&final_name, info.metadata.destination_path());

        self.paths
            .move_file(&self.staging.payload_path(&info.id), &dest)
            .await?;

        if info.metadata.uses_original_filename() {
            let sidecar_dest = dest.with_file_name(format!("{}.json", final_name));
            self.paths
                .move_file(&self.staging.sidecar_path(&info.id), &sidecar_dest)
                .await?;
        } else {
            match tokio::fs::remove_file(self.staging.sidecar_path(&info.id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("删除 sidecar 失败: id={}, 错误: {}", info.id, e),
            }
        }

        self.staging.discard_lock(&info.id);

        info!("上传已落盘: id={}, 目标={:?}", info.id, dest);
        Ok(())
    }

    /// 中止一个分片组（termination 扩展删除组成员时调用）
    pub fn abort_group(&self, multipart_id: &str) -> bool {
        let removed = self.assemblies.remove(multipart_id).is_some();
        if removed {
            info!("分片组 {} 已中止", multipart_id);
        }
        removed
    }

    /// 活跃分片组数量
    pub fn active_groups(&self) -> usize {
        self.assemblies.len()
    }

    /// 启动时从暂存目录重建分片组状态
    ///
    /// 扫描 sidecar，把已收满字节的分片重新登记；扫描后已收齐的组
    /// 立即重组（进程重启横跨了最后一个分片完成与重组之间的窗口）
    pub async fn rehydrate(&self) -> Result<usize> {
        let infos = self.staging.scan().await?;
        let mut restored = 0usize;
        let mut ready = Vec::new();

        for info in infos {
            if !info.metadata.is_multipart_part() || !info.is_complete() {
                continue;
            }
            let (Some(multipart_id), Some(part_index), Some(total_parts)) = (
                info.metadata.multipart_id.clone(),
                info.metadata.part_index(),
                info.metadata.total_parts(),
            ) else {
                continue;
            };

            let complete = {
                let mut assembly =
                    self.assemblies
                        .entry(multipart_id.clone())
                        .or_insert_with(|| Assembly {
                            parts: HashMap::new(),
                            total_parts,
                            metadata: info.metadata.clone(),
                        });
                assembly.parts.insert(part_index, info.id.clone());
                assembly.parts.len() as u32 >= assembly.total_parts
            };
            restored += 1;

            if complete {
                ready.push(multipart_id);
            }
        }

        for multipart_id in ready {
            if let Some((_, assembly)) = self.assemblies.remove(&multipart_id) {
                info!("重建时发现已收齐的分片组 {}，补做重组", multipart_id);
                if let Err(e) = self.reassemble(&multipart_id, assembly).await {
                    error!("重建分片组 {} 重组失败: {}", multipart_id, e);
                }
            }
        }

        if restored > 0 {
            info!(
                "已重建 {} 个分片记录，当前活跃分片组 {} 个",
                restored,
                self.assemblies.len()
            );
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("active_groups", &self.assemblies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DEFAULT_SANITIZE_PATTERN;
    use crate::tus::UploadMetadata;
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        staging: Arc<StagingStore>,
        assembler: Assembler,
        mount: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let staging_dir = temp.path().join("staging");
        let mount = temp.path().join("uploads");

        let staging = Arc::new(StagingStore::new(staging_dir).unwrap());
        let paths =
            Arc::new(PathService::new(mount.clone(), DEFAULT_SANITIZE_PATTERN).unwrap());
        let strategies = Arc::new(StrategyRegistry::with_builtins(paths.clone()));
        let assembler = Assembler::new(staging.clone(), paths, strategies);

        Fixture {
            _temp: temp,
            staging,
            assembler,
            mount,
        }
    }

    fn part_metadata(multipart_id: &str, index: u32, total: u32, original_size: u64) -> UploadMetadata {
        UploadMetadata {
            filename: Some("big.bin".to_string()),
            with_filename: Some("default".to_string()),
            multipart_id: Some(multipart_id.to_string()),
            part_index: Some(index.to_string()),
            total_parts: Some(total.to_string()),
            original_file_size: Some(original_size.to_string()),
            ..Default::default()
        }
    }

    async fn staged_part(
        fx: &Fixture,
        metadata: UploadMetadata,
        content: &'static [u8],
    ) -> UploadInfo {
        let mut info = fx
            .staging
            .create(content.len() as u64, metadata)
            .await
            .unwrap();
        let stream = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            content,
        ))]);
        let written = fx.staging.append_body(&info.id, stream).await.unwrap();
        info.offset += written;
        fx.staging.write_info(&info).await.unwrap();
        info
    }

    fn dir_entry_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_out_of_order_assembly() {
        let fx = fixture();
        let total_size = (b"AAAA".len() + b"BBB".len() + b"CC".len()) as u64;

        let p1 = staged_part(&fx, part_metadata("m1", 1, 3, total_size), b"AAAA").await;
        let p2 = staged_part(&fx, part_metadata("m1", 2, 3, total_size), b"BBB").await;
        let p3 = staged_part(&fx, part_metadata("m1", 3, 3, total_size), b"CC").await;

        // 到达顺序 2、3、1，前两个不触发重组
        assert!(!fx.assembler.finalize(&p2).await.unwrap());
        assert!(!fx.assembler.finalize(&p3).await.unwrap());
        assert_eq!(fx.assembler.active_groups(), 1);

        assert!(fx.assembler.finalize(&p1).await.unwrap());
        assert_eq!(fx.assembler.active_groups(), 0);

        // 目标字节按序号顺序拼接，命名策略 default 用基底暂存标识
        let dest = fx.mount.join(&p1.id);
        assert_eq!(std::fs::read(&dest).unwrap(), b"AAAABBBCC");

        // 暂存目录已清空
        assert_eq!(dir_entry_count(fx.staging.dir()), 0);
    }

    #[tokio::test]
    async fn test_solo_finalize_default_naming() {
        let fx = fixture();
        let info = staged_part(&fx, UploadMetadata::default(), b"hello world").await;

        assert!(fx.assembler.finalize(&info).await.unwrap());

        let dest = fx.mount.join(&info.id);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        // default 命名不保留 sidecar
        assert!(!fx.mount.join(format!("{}.json", info.id)).exists());
        assert_eq!(dir_entry_count(fx.staging.dir()), 0);
    }

    #[tokio::test]
    async fn test_solo_finalize_original_keeps_sidecar() {
        let fx = fixture();
        let metadata = UploadMetadata {
            filename: Some("report.pdf".to_string()),
            with_filename: Some("original".to_string()),
            ..Default::default()
        };
        let info = staged_part(&fx, metadata, b"pdf-bytes").await;

        assert!(fx.assembler.finalize(&info).await.unwrap());

        assert_eq!(
            std::fs::read(fx.mount.join("report.pdf")).unwrap(),
            b"pdf-bytes"
        );
        assert!(fx.mount.join("report.pdf.json").exists());
        assert_eq!(dir_entry_count(fx.staging.dir()), 0);
    }

    #[tokio::test]
    async fn test_total_parts_one_is_solo() {
        let fx = fixture();
        let metadata = UploadMetadata {
            multipart_id: Some("m-solo".to_string()),
            part_index: Some("1".to_string()),
            total_parts: Some("1".to_string()),
            ..Default::default()
        };
        let info = staged_part(&fx, metadata, b"solo").await;

        // totalParts == "1" 直接走单体路径
        assert!(fx.assembler.finalize(&info).await.unwrap());
        assert_eq!(fx.assembler.active_groups(), 0);
        assert!(fx.mount.join(&info.id).exists());
    }

    #[tokio::test]
    async fn test_missing_part_fails_and_discards() {
        let fx = fixture();

        // 2 号分片已完成但其载荷被外部删除
        let p1 = staged_part(&fx, part_metadata("m2", 1, 2, 8), b"AAAA").await;
        let p2 = staged_part(&fx, part_metadata("m2", 2, 2, 8), b"BBBB").await;
        std::fs::remove_file(fx.staging.payload_path(&p2.id)).unwrap();

        assert!(!fx.assembler.finalize(&p2).await.unwrap());
        let err = fx.assembler.finalize(&p1).await.unwrap_err();
        assert!(format!("{err:#}").contains("分片载荷"), "err: {err:#}");

        // 失败后组条目已摘除，不会再次触发
        assert_eq!(fx.assembler.active_groups(), 0);
    }

    #[tokio::test]
    async fn test_abort_group() {
        let fx = fixture();
        let p1 = staged_part(&fx, part_metadata("m3", 1, 2, 8), b"AAAA").await;

        assert!(!fx.assembler.finalize(&p1).await.unwrap());
        assert_eq!(fx.assembler.active_groups(), 1);

        assert!(fx.assembler.abort_group("m3"));
        assert_eq!(fx.assembler.active_groups(), 0);
        assert!(!fx.assembler.abort_group("m3"));
    }

    #[tokio::test]
    async fn test_rehydrate_restores_and_completes() {
        let fx = fixture();
        let total_size = 8u64;

        // 两个已完成的分片躺在暂存目录里，进程重启后无人再 PATCH
        let p1 = staged_part(&fx, part_metadata("m4", 1, 2, total_size), b"AAAA").await;
        let _p2 = staged_part(&fx, part_metadata("m4", 2, 2, total_size), b"BBBB").await;

        let restored = fx.assembler.rehydrate().await.unwrap();
        assert_eq!(restored, 2);

        // 收齐的组在重建时立即补做重组
        assert_eq!(fx.assembler.active_groups(), 0);
        assert_eq!(std::fs::read(fx.mount.join(&p1.id)).unwrap(), b"AAAABBBB");
    }

    #[tokio::test]
    async fn test_rehydrate_partial_group_waits() {
        let fx = fixture();

        let _p1 = staged_part(&fx, part_metadata("m5", 1, 3, 12), b"AAAA").await;
        let _p2 = staged_part(&fx, part_metadata("m5", 2, 3, 12), b"BBBB").await;

        let restored = fx.assembler.rehydrate().await.unwrap();
        assert_eq!(restored, 2);
        // 组未收齐，保持等待
        assert_eq!(fx.assembler.active_groups(), 1);
    }
}
