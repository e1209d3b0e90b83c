use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use homelink_shared::ErrorBody;
use std::any::Any;
use std::time::Instant;
use tracing::{error, info, warn};

pub async fn request_logging(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    info!("Incoming request: {} {}", method, uri);

    let response = next.run(req).await;
    let status = response.status();
    let duration = start.elapsed();

    if status.is_success() {
        info!("Request completed: {} {} - {}ms", method, uri, duration.as_millis());
    } else if status.is_client_error() {
        warn!("Client error: {} {} - {} ({}ms)", method, uri, status, duration.as_millis());
    } else {
        error!("Server error: {} {} - {} ({}ms)", method, uri, status, duration.as_millis());
    }

    response
}

/// 通用 500，不暴露内部细节
pub fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody::new("Internal server error")),
    )
        .into_response()
}

// CatchPanicLayer 的兜底处理
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    error!("Unhandled error: {}", detail);
    internal_error()
}
