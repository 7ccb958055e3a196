// 路径与文件名服务
//
// 负责文件名清洗、目标目录解析、重名探测与最终落盘移动

use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 默认文件名非法字符模式
pub const DEFAULT_SANITIZE_PATTERN: &str = "[^A-Za-z0-9._-]";

/// 路径与文件名服务
#[derive(Debug)]
pub struct PathService {
    /// 最终落盘挂载根目录
    mount_path: PathBuf,
    /// 文件名非法字符模式
    sanitize_regex: Regex,
}

impl PathService {
    /// 创建路径服务
    ///
    /// # 参数
    /// * `mount_path` - 落盘根目录
    /// * `sanitize_pattern` - 非法字符模式，匹配到的字节替换为 `_`
    pub fn new(mount_path: PathBuf, sanitize_pattern: &str) -> Result<Self> {
        let sanitize_regex = Regex::new(sanitize_pattern)
            .with_context(|| format!("文件名清洗模式无效: {}", sanitize_pattern))?;
        Ok(Self {
            mount_path,
            sanitize_regex,
        })
    }

    /// 落盘根目录
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// 清洗文件名：非法字符替换为 `_`（幂等）
    pub fn sanitize(&self, name: &str) -> String {
        self.sanitize_regex.replace_all(name, "_").into_owned()
    }

    /// 规范化目标子目录
    ///
    /// 去除首尾分隔符；空输入返回空串，非空结果以 `/` 结尾
    pub fn normalize(&self, dest_path: &str) -> String {
        let trimmed = dest_path.trim_matches(|c| c == '/' || c == '\\');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}/", trimmed)
        }
    }

    /// 目标目录的绝对路径
    pub fn destination_dir(&self, dest_path: &str) -> PathBuf {
        let normalized = self.normalize(dest_path);
        if normalized.is_empty() {
            self.mount_path.clone()
        } else {
            self.mount_path.join(normalized)
        }
    }

    /// 文件在目标目录下的完整路径
    pub fn full_path(&self, filename: &str, dest_path: &str) -> PathBuf {
        self.destination_dir(dest_path).join(filename)
    }

    /// 文件是否已存在于目标目录
    pub fn exists(&self, filename: &str, dest_path: &str) -> bool {
        self.full_path(filename, dest_path).exists()
    }

    /// 生成目录内不重名的文件名
    ///
    /// 拆分主名和扩展名，依次探测 `base(1).ext`、`base(2).ext`…
    /// 返回时保证目录存在；调用点与实际落盘之间的竞态窗口由单进程写入假设覆盖
    pub fn unique_name(&self, filename: &str, dir: &Path) -> String {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("创建目标目录失败 {:?}: {}", dir, e);
        }

        if !dir.join(filename).exists() {
            return filename.to_string();
        }

        let (base, ext) = split_extension(filename);
        let mut counter = 1u32;
        loop {
            let candidate = format!("{}({}){}", base, counter, ext);
            if !dir.join(&candidate).exists() {
                debug!("重名文件 {} 重命名为 {}", filename, candidate);
                return candidate;
            }
            counter += 1;
        }
    }

    /// 移动文件到目标位置
    ///
    /// 目标父目录按需创建；rename 跨设备失败时回退为复制加删除
    pub async fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建目标目录失败: {:?}", parent))?;
        }

        match tokio::fs::rename(src, dst).await {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!("跨设备移动 {:?} -> {:?}，回退为复制", src, dst);
                tokio::fs::copy(src, dst)
                    .await
                    .with_context(|| format!("复制文件失败: {:?} -> {:?}", src, dst))?;
                tokio::fs::remove_file(src)
                    .await
                    .with_context(|| format!("删除源文件失败: {:?}", src))?;
                Ok(())
            }
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("移动文件失败: {:?} -> {:?}", src, dst)))
            }
        }
    }
}

/// 拆分主名和扩展名，扩展名含点号
///
/// 首字符的点号不算扩展名（如 `.gitignore`）
fn split_extension(filename: &str) -> (&str, &str) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], &filename[idx..]),
        _ => (filename, ""),
    }
}

/// 是否为跨设备错误（EXDEV / ERROR_NOT_SAME_DEVICE）
fn is_cross_device(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(18) | Some(17))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn service(mount: &Path) -> PathService {
        PathService::new(mount.to_path_buf(), DEFAULT_SANITIZE_PATTERN).unwrap()
    }

    #[test]
    fn test_sanitize() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());

        assert_eq!(svc.sanitize("report.pdf"), "report.pdf");
        assert_eq!(svc.sanitize("a b/c:d.txt"), "a_b_c_d.txt");
        assert_eq!(svc.sanitize("中文名.txt"), "_________.txt");

        // 幂等性
        let once = svc.sanitize("a b/c:d.txt");
        assert_eq!(svc.sanitize(&once), once);
    }

    #[test]
    fn test_normalize() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());

        assert_eq!(svc.normalize(""), "");
        assert_eq!(svc.normalize("/"), "");
        assert_eq!(svc.normalize("photos"), "photos/");
        assert_eq!(svc.normalize("/photos/2024/"), "photos/2024/");

        // 幂等性（去掉末尾分隔符后再规范化结果不变）
        let once = svc.normalize("/photos/2024/");
        assert_eq!(svc.normalize(&once), once);
    }

    #[test]
    fn test_destination_and_full_path() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());

        assert_eq!(svc.destination_dir(""), temp.path());
        assert_eq!(
            svc.full_path("a.txt", "photos"),
            temp.path().join("photos/").join("a.txt")
        );
    }

    #[test]
    fn test_unique_name() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());
        let dir = temp.path().join("out");

        // 目录不存在时会被创建，首个名字直接可用
        assert_eq!(svc.unique_name("report.pdf", &dir), "report.pdf");
        assert!(dir.exists());

        File::create(dir.join("report.pdf")).unwrap();
        assert_eq!(svc.unique_name("report.pdf", &dir), "report(1).pdf");

        File::create(dir.join("report(1).pdf")).unwrap();
        assert_eq!(svc.unique_name("report.pdf", &dir), "report(2).pdf");

        // 无扩展名
        File::create(dir.join("README")).unwrap();
        assert_eq!(svc.unique_name("README", &dir), "README(1)");

        // 返回值在调用时刻一定不与磁盘冲突
        let name = svc.unique_name("report.pdf", &dir);
        assert!(!dir.join(&name).exists());
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.txt"), ("a", ".txt"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".gitignore"), (".gitignore", ""));
    }

    #[test]
    fn test_exists() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());

        assert!(!svc.exists("a.txt", ""));
        File::create(temp.path().join("a.txt")).unwrap();
        assert!(svc.exists("a.txt", ""));
    }

    #[tokio::test]
    async fn test_move_file() {
        let temp = TempDir::new().unwrap();
        let svc = service(temp.path());

        let src = temp.path().join("src.bin");
        std::fs::write(&src, b"hello").unwrap();

        let dst = temp.path().join("nested/dir/dst.bin");
        svc.move_file(&src, &dst).await.unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }
}
