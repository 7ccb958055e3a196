// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::routing::{patch, post};
use axum::Router;

/// 构建上传 API 路由
///
/// 根路径与带标识路径分别挂两条（带不带结尾斜杠都可达）
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/upload",
            post(handlers::create_upload).options(handlers::upload_options),
        )
        .route(
            "/api/upload/",
            post(handlers::create_upload).options(handlers::upload_options),
        )
        .route(
            "/api/upload/:id",
            patch(handlers::append_upload)
                .head(handlers::head_upload)
                .delete(handlers::terminate_upload),
        )
        .with_state(state)
}
