pub mod admin;
pub mod control;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::info;

/// 记录每个请求的方法和路径
pub async fn log_request(req: Request, next: Next) -> Response {
    info!("{} {}", req.method(), req.uri().path());
    next.run(req).await
}
