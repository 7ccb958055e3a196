// TUS 协议处理器
//
// 四个核心操作 + termination 扩展：
// - POST   /api/upload/      创建上传（creation 扩展，含重名预检）
// - PATCH  /api/upload/{id}  按偏移追加字节，收满后触发落盘/重组
// - HEAD   /api/upload/{id}  查询偏移（断点续传）
// - OPTIONS /api/upload/     能力通告
// - DELETE /api/upload/{id}  终止上传（termination 扩展）

use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::tus::{
    parse_upload_metadata, HEADER_TUS_EXTENSION, HEADER_TUS_RESUMABLE, HEADER_TUS_VERSION,
    HEADER_UPLOAD_COMPLETE, HEADER_UPLOAD_LENGTH, HEADER_UPLOAD_METADATA, HEADER_UPLOAD_OFFSET,
    OFFSET_CONTENT_TYPE, TUS_EXTENSIONS, TUS_VERSION,
};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

/// 预置 Tus-Resumable 头的响应构造器
fn tus_response(status: StatusCode) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header(HEADER_TUS_RESUMABLE, TUS_VERSION)
}

/// 读取请求头并转为字符串
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 创建上传
///
/// POST /api/upload/
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let upload_length: u64 = header_str(&headers, HEADER_UPLOAD_LENGTH)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::bad_request("缺少或无效的 Upload-Length"))?;

    let max_file_size = state.config.storage.max_file_size();
    if upload_length > max_file_size {
        return Err(ApiError::payload_too_large(format!(
            "Upload-Length {} 超过单文件上限 {}",
            upload_length, max_file_size
        )));
    }

    let metadata = header_str(&headers, HEADER_UPLOAD_METADATA)
        .map(parse_upload_metadata)
        .unwrap_or_default();

    // 重名预检：original + prevent 组合在创建时即拒绝
    // 其余重名策略在落盘时改名
    if metadata.with_filename() == "original" && metadata.on_duplicate() == "prevent" {
        if let Some(filename) = metadata.filename.as_deref().filter(|f| !f.is_empty()) {
            let sanitized = state.paths.sanitize(filename);
            if state.paths.exists(&sanitized, metadata.destination_path()) {
                info!("重名预检拒绝: {}", sanitized);
                return Err(ApiError::conflict(format!(
                    "File \"{}\" already exists and duplicates are not allowed",
                    sanitized
                )));
            }
        }
    }

    let info = state.staging.create(upload_length, metadata).await?;

    let scheme = header_str(&headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(&headers, "host").unwrap_or("localhost");
    let location = format!("{}://{}/api/upload/{}", scheme, host, info.id);

    info!(
        "上传已创建: id={}, size={}, multipart={}",
        info.id,
        info.size,
        info.metadata.is_multipart_part()
    );

    let response = tus_response(StatusCode::CREATED)
        .header(header::LOCATION, location)
        .header(HEADER_UPLOAD_OFFSET, "0")
        .body(Body::empty())
        .map_err(anyhow::Error::new)?;
    Ok(response)
}

/// 追加字节
///
/// PATCH /api/upload/{id}
pub async fn append_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).unwrap_or("");
    if content_type != OFFSET_CONTENT_TYPE {
        return Err(ApiError::bad_request(format!(
            "Content-Type 必须为 {}",
            OFFSET_CONTENT_TYPE
        )));
    }

    let client_offset: u64 = header_str(&headers, HEADER_UPLOAD_OFFSET)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError::bad_request("缺少或无效的 Upload-Offset"))?;

    // sidecar 读改写按 staging_id 串行化
    let _guard = state.staging.lock(&id).await;

    let mut info = state
        .staging
        .load(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("上传不存在: {}", id)))?;

    if client_offset != info.offset {
        warn!(
            "偏移不一致: id={}, 客户端={}, 服务器={}",
            id, client_offset, info.offset
        );
        return Err(ApiError::conflict(format!(
            "Upload-Offset 不一致: 期望 {}, 收到 {}",
            info.offset, client_offset
        )));
    }

    let stream = Box::pin(body.into_data_stream().map_err(std::io::Error::other));
    let written = state.staging.append_body(&id, stream).await?;

    info.offset += written;
    state.staging.write_info(&info).await?;

    debug!(
        "已追加 {} bytes: id={}, offset={}/{}",
        written, id, info.offset, info.size
    );

    // 收满后触发落盘；分片组成员仅在整组收齐时报告完成
    let mut whole_file_complete = false;
    if info.is_complete() {
        whole_file_complete = state.assembler.finalize(&info).await?;
    }

    let mut builder = tus_response(StatusCode::NO_CONTENT)
        .header(HEADER_UPLOAD_OFFSET, info.offset.to_string());
    if whole_file_complete {
        builder = builder.header(HEADER_UPLOAD_COMPLETE, "true");
    }
    Ok(builder.body(Body::empty()).map_err(anyhow::Error::new)?)
}

/// 查询偏移
///
/// HEAD /api/upload/{id}
pub async fn head_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let info = state
        .staging
        .load(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("上传不存在: {}", id)))?;

    let response = tus_response(StatusCode::OK)
        .header(HEADER_UPLOAD_OFFSET, info.offset.to_string())
        .header(HEADER_UPLOAD_LENGTH, info.size.to_string())
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::empty())
        .map_err(anyhow::Error::new)?;
    Ok(response)
}

/// 能力通告
///
/// OPTIONS /api/upload/
pub async fn upload_options() -> ApiResult<Response> {
    let response = tus_response(StatusCode::NO_CONTENT)
        .header(HEADER_TUS_VERSION, TUS_VERSION)
        .header(HEADER_TUS_EXTENSION, TUS_EXTENSIONS)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            "POST, PATCH, HEAD, DELETE, OPTIONS",
        )
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Tus-Resumable, Upload-Length, Upload-Metadata, Upload-Offset, Content-Type",
        )
        .header(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            "Tus-Resumable, Upload-Offset, Upload-Length, Upload-Complete, Location",
        )
        .body(Body::empty())
        .map_err(anyhow::Error::new)?;
    Ok(response)
}

/// 终止上传（termination 扩展）
///
/// DELETE /api/upload/{id}
/// 删除暂存载荷与 sidecar；被删的是分片组成员时一并中止该组
pub async fn terminate_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let _guard = state.staging.lock(&id).await;

    let info = state
        .staging
        .load(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("上传不存在: {}", id)))?;

    if let Some(multipart_id) = info.metadata.multipart_id.as_deref() {
        if info.metadata.is_multipart_part() {
            state.assembler.abort_group(multipart_id);
        }
    }

    state.staging.delete(&id).await?;
    info!("上传已终止: id={}", id);

    Ok(tus_response(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .map_err(anyhow::Error::new)?)
}
