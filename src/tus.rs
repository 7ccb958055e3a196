// TUS 协议常量与 Upload-Metadata 编解码
//
// Upload-Metadata 格式：逗号分隔的 `key base64(value)` 对，
// 空对或格式错误的对静默丢弃

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// 支持的 TUS 协议版本
pub const TUS_VERSION: &str = "1.0.0";

/// 已实现的协议扩展
pub const TUS_EXTENSIONS: &str = "creation,termination";

/// PATCH 请求体要求的 Content-Type
pub const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

// 协议头名称
pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_TUS_VERSION: &str = "Tus-Version";
pub const HEADER_TUS_EXTENSION: &str = "Tus-Extension";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_COMPLETE: &str = "Upload-Complete";

/// 上传元数据
///
/// 所有值在协议层均为字符串，数值字段在使用处解析
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadMetadata {
    /// 调用方提供的显示文件名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME 类型提示（引擎不解释）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filetype: Option<String>,
    /// 最终命名策略（default | original | 自定义）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_filename: Option<String>,
    /// 重名策略（prevent | number | 自定义）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_duplicate: Option<String>,
    /// 挂载根目录下的目标子目录
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<String>,
    /// 分片组共享标识
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multipart_id: Option<String>,
    /// 组内序号（1 起始）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_index: Option<String>,
    /// 组大小
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_parts: Option<String>,
    /// 重组后文件的权威大小
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file_size: Option<String>,
}

impl UploadMetadata {
    /// 是否为分片组成员
    ///
    /// multipartId、partIndex、totalParts 三者齐全且 totalParts != "1"
    pub fn is_multipart_part(&self) -> bool {
        self.multipart_id.is_some()
            && self.part_index.is_some()
            && self.total_parts.as_deref().is_some_and(|t| t != "1")
    }

    /// 命名策略名（缺省 default）
    pub fn with_filename(&self) -> &str {
        self.with_filename.as_deref().unwrap_or("default")
    }

    /// 重名策略名（缺省 prevent）
    pub fn on_duplicate(&self) -> &str {
        self.on_duplicate.as_deref().unwrap_or("prevent")
    }

    /// 目标子目录（缺省空）
    pub fn destination_path(&self) -> &str {
        self.destination_path.as_deref().unwrap_or("")
    }

    /// 是否保留原始文件名（决定落盘后 sidecar 去留）
    pub fn uses_original_filename(&self) -> bool {
        self.with_filename() == "original"
            && self.filename.as_deref().is_some_and(|f| !f.is_empty())
    }

    /// 解析组内序号
    pub fn part_index(&self) -> Option<u32> {
        self.part_index.as_deref().and_then(|v| v.parse().ok())
    }

    /// 解析组大小
    pub fn total_parts(&self) -> Option<u32> {
        self.total_parts.as_deref().and_then(|v| v.parse().ok())
    }

    /// 解析重组后文件大小
    pub fn original_file_size(&self) -> Option<u64> {
        self.original_file_size
            .as_deref()
            .and_then(|v| v.parse().ok())
    }
}

/// 解析 Upload-Metadata 头
pub fn parse_upload_metadata(header: &str) -> UploadMetadata {
    let mut metadata = UploadMetadata::default();

    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let mut iter = pair.splitn(2, ' ');
        let key = match iter.next() {
            Some(k) if !k.is_empty() => k,
            _ => continue,
        };
        let value = match iter.next() {
            Some(encoded) => match general_purpose::STANDARD.decode(encoded.trim()) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(v) => v,
                    Err(_) => continue,
                },
                Err(_) => continue,
            },
            // 无值的键丢弃
            None => continue,
        };

        match key {
            "filename" => metadata.filename = Some(value),
            "filetype" => metadata.filetype = Some(value),
            "withFilename" => metadata.with_filename = Some(value),
            "onDuplicate" => metadata.on_duplicate = Some(value),
            "destinationPath" => metadata.destination_path = Some(value),
            "multipartId" => metadata.multipart_id = Some(value),
            "partIndex" => metadata.part_index = Some(value),
            "totalParts" => metadata.total_parts = Some(value),
            "originalFileSize" => metadata.original_file_size = Some(value),
            // 未知键忽略
            _ => {}
        }
    }

    metadata
}

/// 编码 Upload-Metadata 头（客户端使用）
pub fn encode_upload_metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{} {}", key, general_purpose::STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}
