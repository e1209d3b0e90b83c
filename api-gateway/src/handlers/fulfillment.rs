use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::dispatcher::{DeviceCommand, DispatchError, Dispatched};
use crate::middleware::internal_error;

pub const NOT_CONNECTED_REPLY: &str = "Sorry, the smart home system is not connected right now.";
pub const FAILURE_REPLY: &str = "Sorry, I couldn't control the device. Please try again.";
pub const FALLBACK_REPLY: &str = "Sorry, I didn't catch that.";

// Dialogflow webhook 请求，只取用到的字段
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRequest {
    #[serde(default)]
    pub query_result: QueryResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub query_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    #[serde(default)]
    pub display_name: String,
}

impl QueryResult {
    fn param(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }
}

/// 语音回复，同时带 Actions on Google 的 payload
pub fn voice_reply(text: &str) -> Value {
    json!({
        "fulfillmentText": text,
        "payload": {
            "google": {
                "expectUserResponse": true,
                "richResponse": {
                    "items": [
                        { "simpleResponse": { "textToSpeech": text } }
                    ]
                }
            }
        }
    })
}

pub fn confirmation(dispatched: &Dispatched, device_name: &str, status: &str) -> String {
    if dispatched.shape.is_servo() {
        format!("I've {} the {}", status, device_name)
    } else {
        format!("I've turned {} the {}", status, device_name)
    }
}

pub async fn fulfillment(
    State(app_state): State<AppState>,
    body: Result<Json<WebhookRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejected fulfillment request: {}", rejection.body_text());
            return internal_error();
        }
    };

    let query = request.query_result;
    info!(
        "Fulfillment intent: {} ({:?})",
        query.intent.display_name,
        query.query_text.as_deref().unwrap_or_default()
    );

    let reply = match query.intent.display_name.as_str() {
        "devicecontrol" => device_control(&app_state, &query).await,
        "devicestatus" => device_status(&app_state, &query),
        other => {
            warn!("Unhandled intent: {}", other);
            FALLBACK_REPLY.to_string()
        }
    };

    Json(voice_reply(&reply)).into_response()
}

async fn device_control(app_state: &AppState, query: &QueryResult) -> String {
    if !app_state.dispatcher.is_connected() {
        return NOT_CONNECTED_REPLY.to_string();
    }

    let device_name = query.param("devicename").unwrap_or_default();
    let status = query.param("devicestatus");

    match app_state
        .dispatcher
        .dispatch(DeviceCommand::voice(device_name, status))
        .await
    {
        Ok(dispatched) => confirmation(&dispatched, device_name, status.unwrap_or_default()),
        Err(DispatchError::UnknownDevice(_)) => format!("I don't know how to control the {}", device_name),
        Err(DispatchError::ServiceUnavailable) => NOT_CONNECTED_REPLY.to_string(),
        Err(e) => {
            warn!("Error controlling device {}: {}", device_name, e);
            FAILURE_REPLY.to_string()
        }
    }
}

// 设备状态查询尚未实现，只做连接检查
fn device_status(app_state: &AppState, query: &QueryResult) -> String {
    if !app_state.dispatcher.is_connected() {
        return NOT_CONNECTED_REPLY.to_string();
    }

    let device_name = query.param("devicename").unwrap_or_default();
    format!("I'm sorry, I can't check the status of the {} yet.", device_name)
}
