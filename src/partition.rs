// 分片策略
//
// 根据文件大小计算并行上传的分片数
// 小文件单流，大文件封顶，中间按单分片大小向上取整

use crate::config::PartitionConfig;

/// 默认单分片大小: 512MB
pub const DEFAULT_PART_SIZE: u64 = 512 * 1024 * 1024;

/// 默认最大分片数
pub const DEFAULT_MAX_PARTS: u32 = 8;

/// 分片策略
#[derive(Debug, Clone, Copy)]
pub struct PartitionPolicy {
    /// 单分片大小（字节）
    pub part_size: u64,
    /// 最大分片数
    pub max_parts: u32,
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_parts: DEFAULT_MAX_PARTS,
        }
    }
}

impl From<&PartitionConfig> for PartitionPolicy {
    fn from(config: &PartitionConfig) -> Self {
        Self {
            part_size: config.part_size_mb * 1024 * 1024,
            max_parts: config.max_parts,
        }
    }
}

impl PartitionPolicy {
    /// 根据文件大小计算分片数
    ///
    /// - 不超过单分片大小 → 1
    /// - 超过 max_parts 个分片容量 → max_parts
    /// - 其余按单分片大小向上取整
    pub fn part_count(&self, size: u64) -> u32 {
        if size <= self.part_size {
            return 1;
        }
        let parts = size.div_ceil(self.part_size);
        parts.min(self.max_parts as u64) as u32
    }
}
