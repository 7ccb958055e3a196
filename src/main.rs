use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tus_upload_rust::config::{AppConfig, LogConfig};
use tus_upload_rust::server::{api_router, AppState};
use tus_upload_rust::{logging, tus};

/// 加载日志配置
///
/// 尝试从配置文件加载，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

/// 健康检查响应
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

/// 健康检查处理器
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "tus-upload-rust".to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = "config/app.toml";

    // 先加载日志配置并初始化日志系统（_log_guard 必须保持存活）
    let log_config = load_log_config(config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("TUS Upload Rust 启动中...");

    // 加载配置（STAGING_DIR / MOUNT_PATH 环境变量可覆盖）
    let config = AppConfig::load_or_default(config_path).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!(
        "存储配置: 暂存目录={:?}, 落盘目录={:?}, 单文件上限={}GB",
        config.storage.staging_dir, config.storage.mount_path, config.storage.max_file_size_gb
    );

    // 创建应用状态（含暂存目录扫描与分片组重建）
    let state = AppState::new(config).await?;
    info!("应用状态初始化完成");

    // 中间件：HTTP 请求日志 + 宽松 CORS（暴露 TUS 响应头）
    let middleware = ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers([
                axum::http::HeaderName::from_static("tus-resumable"),
                axum::http::HeaderName::from_static("upload-offset"),
                axum::http::HeaderName::from_static("upload-length"),
                axum::http::HeaderName::from_static("upload-complete"),
                axum::http::header::LOCATION,
            ]),
    );

    // 构建完整应用
    let app = Router::new()
        .merge(api_router(state))
        .route("/health", get(health_check))
        .layer(middleware);

    info!("服务器启动在: http://{}", addr);
    info!("TUS 端点: http://{}/api/upload/ (版本 {})", addr, tus::TUS_VERSION);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app);

    // 监听关闭信号，支持优雅关闭
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    info!("应用已安全退出");
    Ok(())
}
