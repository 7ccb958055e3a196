// 命名与重名策略注册表
//
// 两张表均为 名字 -> 纯函数 的开放分发，启动时可注册自定义策略
// 未知名字回退到文档化的默认策略，从不报错

use crate::path::PathService;
use crate::tus::UploadMetadata;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// 重名策略：(文件名, 目标目录) -> 文件名
pub type DuplicateHandler = Arc<dyn Fn(&str, &Path) -> String + Send + Sync>;

/// 命名策略：(注册表, 元数据, 暂存标识) -> 文件名
pub type FilenameHandler =
    Arc<dyn Fn(&StrategyRegistry, &UploadMetadata, &str) -> String + Send + Sync>;

/// 策略注册表
pub struct StrategyRegistry {
    paths: Arc<PathService>,
    duplicate_handlers: RwLock<HashMap<String, DuplicateHandler>>,
    filename_handlers: RwLock<HashMap<String, FilenameHandler>>,
}

impl StrategyRegistry {
    /// 创建注册表并注册内置策略
    ///
    /// 重名策略：
    /// - `prevent`：原样返回（拒绝发生在创建时的预检，见 TUS 端点）
    /// - `number`：探测 `base(1).ext`、`base(2).ext`… 返回首个可用名
    ///
    /// 命名策略：
    /// - `default`：使用暂存标识
    /// - `original`：清洗调用方文件名（缺失时回退暂存标识），再应用重名策略
    pub fn with_builtins(paths: Arc<PathService>) -> Self {
        let registry = Self {
            paths,
            duplicate_handlers: RwLock::new(HashMap::new()),
            filename_handlers: RwLock::new(HashMap::new()),
        };

        registry.register_duplicate("prevent", Arc::new(|filename, _dir| filename.to_string()));

        let paths = registry.paths.clone();
        registry.register_duplicate(
            "number",
            Arc::new(move |filename, dir| paths.unique_name(filename, dir)),
        );

        registry.register_filename(
            "default",
            Arc::new(|_registry, _metadata, staging_id| staging_id.to_string()),
        );

        let paths = registry.paths.clone();
        registry.register_filename(
            "original",
            Arc::new(move |registry, metadata, staging_id| {
                let name = match metadata.filename.as_deref() {
                    Some(filename) if !filename.is_empty() => paths.sanitize(filename),
                    _ => staging_id.to_string(),
                };
                let dir = paths.destination_dir(metadata.destination_path());
                registry.apply_duplicate(metadata.on_duplicate(), &name, &dir)
            }),
        );

        registry
    }

    /// 注册重名策略
    pub fn register_duplicate(&self, name: &str, handler: DuplicateHandler) {
        debug!("注册重名策略: {}", name);
        self.duplicate_handlers
            .write()
            .insert(name.to_string(), handler);
    }

    /// 注册命名策略
    pub fn register_filename(&self, name: &str, handler: FilenameHandler) {
        debug!("注册命名策略: {}", name);
        self.filename_handlers
            .write()
            .insert(name.to_string(), handler);
    }

    /// 应用重名策略，未知名字回退 prevent
    pub fn apply_duplicate(&self, name: &str, filename: &str, dir: &Path) -> String {
        let handler = {
            let handlers = self.duplicate_handlers.read();
            handlers
                .get(name)
                .or_else(|| handlers.get("prevent"))
                .cloned()
        };
        match handler {
            Some(handler) => handler(filename, dir),
            None => filename.to_string(),
        }
    }

    /// 计算最终文件名，按 withFilename 分发，未知名字回退 default
    pub fn final_filename(&self, metadata: &UploadMetadata, staging_id: &str) -> String {
        let handler = {
            let handlers = self.filename_handlers.read();
            handlers
                .get(metadata.with_filename())
                .or_else(|| handlers.get("default"))
                .cloned()
        };
        match handler {
            Some(handler) => handler(self, metadata, staging_id),
            None => staging_id.to_string(),
        }
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field(
                "duplicate_handlers",
                &self.duplicate_handlers.read().keys().collect::<Vec<_>>(),
            )
            .field(
                "filename_handlers",
                &self.filename_handlers.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::DEFAULT_SANITIZE_PATTERN;
    use std::fs::File;
    use tempfile::TempDir;

    fn registry(mount: &Path) -> StrategyRegistry {
        let paths =
            Arc::new(PathService::new(mount.to_path_buf(), DEFAULT_SANITIZE_PATTERN).unwrap());
        StrategyRegistry::with_builtins(paths)
    }

    fn original_metadata(filename: &str, on_duplicate: &str) -> UploadMetadata {
        UploadMetadata {
            filename: Some(filename.to_string()),
            with_filename: Some("original".to_string()),
            on_duplicate: Some(on_duplicate.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_strategy() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let metadata = UploadMetadata::default();
        assert_eq!(registry.final_filename(&metadata, "abc123"), "abc123");
    }

    #[test]
    fn test_unknown_strategy_falls_back() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let metadata = UploadMetadata {
            with_filename: Some("no-such-strategy".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.final_filename(&metadata, "abc123"), "abc123");
    }

    #[test]
    fn test_original_prevent() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        // prevent 原样返回，即使磁盘上已存在同名文件
        File::create(temp.path().join("report.pdf")).unwrap();
        let metadata = original_metadata("report.pdf", "prevent");
        assert_eq!(registry.final_filename(&metadata, "abc123"), "report.pdf");
    }

    #[test]
    fn test_original_number() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        File::create(temp.path().join("report.pdf")).unwrap();
        let metadata = original_metadata("report.pdf", "number");
        assert_eq!(
            registry.final_filename(&metadata, "abc123"),
            "report(1).pdf"
        );
    }

    #[test]
    fn test_original_sanitizes() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let metadata = original_metadata("my report!.pdf", "prevent");
        assert_eq!(
            registry.final_filename(&metadata, "abc123"),
            "my_report_.pdf"
        );
    }

    #[test]
    fn test_original_missing_filename_falls_back_to_id() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        let metadata = UploadMetadata {
            with_filename: Some("original".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.final_filename(&metadata, "abc123"), "abc123");
    }

    #[test]
    fn test_custom_registration_dispatch() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        registry.register_filename(
            "timestamped",
            Arc::new(|_registry, _metadata, staging_id| format!("ts-{}", staging_id)),
        );
        let metadata = UploadMetadata {
            with_filename: Some("timestamped".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.final_filename(&metadata, "abc"), "ts-abc");

        registry.register_duplicate(
            "suffix",
            Arc::new(|filename, _dir| format!("{}.dup", filename)),
        );
        assert_eq!(
            registry.apply_duplicate("suffix", "a.txt", temp.path()),
            "a.txt.dup"
        );
    }

    #[test]
    fn test_unknown_duplicate_falls_back_to_prevent() {
        let temp = TempDir::new().unwrap();
        let registry = registry(temp.path());

        assert_eq!(
            registry.apply_duplicate("no-such", "a.txt", temp.path()),
            "a.txt"
        );
    }
}
