use axum::{extract::State, response::Json};
use homelink_shared::{iso_timestamp, now_utc, HealthReport};

use crate::app_state::AppState;

// 只读，完全由当前连接状态得出
pub async fn health_check(State(app_state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".to_string(),
        mqtt_connected: app_state.mqtt.current_state().is_connected(),
        timestamp: iso_timestamp(&now_utc()),
    })
}
