use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use homelink_shared::SuccessBody;
use serde_json::Value;
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::dispatcher::DeviceCommand;
use crate::middleware::internal_error;

pub fn device_routes() -> Router<AppState> {
    Router::new()
        .route("/device/fan", post(control_fan))
        .route("/device/servo/door", post(control_door))
        .route("/device/servo/curtain", post(control_curtain))
        .route("/device/light/room", post(control_room_light))
        .route("/device/light/reading", post(control_reading_lamp))
}

pub async fn control_fan(
    State(app_state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    control_device(&app_state, "fan", body).await
}

pub async fn control_door(
    State(app_state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    control_device(&app_state, "door", body).await
}

pub async fn control_curtain(
    State(app_state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    control_device(&app_state, "curtain", body).await
}

pub async fn control_room_light(
    State(app_state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    control_device(&app_state, "room light", body).await
}

pub async fn control_reading_lamp(
    State(app_state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    control_device(&app_state, "reading lamp", body).await
}

async fn control_device(
    app_state: &AppState,
    device: &str,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        // 没有 JSON 请求体时按空对象处理，交给参数校验
        Err(JsonRejection::MissingJsonContentType(_)) => Value::Null,
        Err(rejection) => {
            warn!("Rejected {} request body: {}", device, rejection.body_text());
            return internal_error();
        }
    };

    match app_state.dispatcher.dispatch(DeviceCommand::rest(device, body)).await {
        Ok(dispatched) => {
            debug!("{} command delivered to {}", device, dispatched.topic);
            Json(SuccessBody::ok()).into_response()
        }
        Err(e) => e.into_response(),
    }
}
