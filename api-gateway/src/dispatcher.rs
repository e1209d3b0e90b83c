use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use homelink_shared::{DevicePayload, ErrorBody, MqttError, OutboundMessage, ServoCommand};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::mqtt::MqttConnectionManager;
use crate::registry::{DeviceEntry, DeviceKind, DeviceRegistry, PayloadShape};

pub const ANGLE_MIN: f64 = 0.0;
pub const ANGLE_MAX: f64 = 180.0;

// 命令来源，影响舵机命令的校验方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Rest,
    Voice,
}

/// 归一化后的设备命令
#[derive(Debug, Clone)]
pub struct DeviceCommand {
    pub device: String,
    pub action: Option<Value>,
    pub raw_params: Map<String, Value>,
    pub surface: Surface,
}

impl DeviceCommand {
    /// REST 请求：动作从请求体中按设备类型取字段
    pub fn rest(device: &str, body: Value) -> Self {
        let raw_params = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            device: device.to_string(),
            action: None,
            raw_params,
            surface: Surface::Rest,
        }
    }

    pub fn voice(device: &str, status: Option<&str>) -> Self {
        Self {
            device: device.to_string(),
            action: status.map(|s| Value::String(s.to_string())),
            raw_params: Map::new(),
            surface: Surface::Voice,
        }
    }

    fn action_for(&self, shape: PayloadShape) -> Option<&Value> {
        self.action
            .as_ref()
            .or_else(|| self.raw_params.get(shape.param_name()))
            .filter(|value| !value.is_null())
    }
}

// 下发结果
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub device: DeviceKind,
    pub shape: PayloadShape,
    pub topic: String,
    pub payload: DevicePayload,
}

// 下发错误
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("{0}")]
    MissingParameter(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    InvalidCommand(String),

    #[error("MQTT client is not connected")]
    ServiceUnavailable,

    #[error("Failed to control {}", .device.display_name())]
    PublishFailed {
        device: DeviceKind,
        #[source]
        source: MqttError,
    },
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            DispatchError::MissingParameter(_)
            | DispatchError::InvalidParameter(_)
            | DispatchError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            DispatchError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::PublishFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

/// 开关类设备的布尔转换：`true` 或字符串 "true"/"on"（不区分大小写）为开，其余为关
pub fn coerce_toggle(value: &Value) -> bool {
    match value {
        Value::Bool(state) => *state,
        Value::String(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("on")
        }
        _ => false,
    }
}

pub fn parse_servo_command(value: Option<&Value>, surface: Surface) -> Result<ServoCommand, DispatchError> {
    let command = value.and_then(Value::as_str).map(str::trim);

    match command {
        None | Some("") if surface == Surface::Voice => {
            Err(DispatchError::MissingParameter("Command is required".to_string()))
        }
        Some(c) if c.eq_ignore_ascii_case("open") => Ok(ServoCommand::Open),
        Some(c) if c.eq_ignore_ascii_case("close") => Ok(ServoCommand::Close),
        // TODO: 语音端无法识别的命令默认关闭，待确认是否应改为拒绝
        _ if surface == Surface::Voice => {
            warn!("Unrecognized servo command {:?}, defaulting to close", command);
            Ok(ServoCommand::Close)
        }
        _ => Err(DispatchError::InvalidCommand(
            "Command must be either \"open\" or \"close\"".to_string(),
        )),
    }
}

pub fn parse_angle(value: Option<&Value>, surface: Surface) -> Result<f64, DispatchError> {
    let invalid = || DispatchError::InvalidParameter("Angle must be a number between 0 and 180".to_string());

    let angle = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let s = s.trim();
            match s.parse::<f64>() {
                Ok(angle) => Some(angle),
                Err(_) if surface == Surface::Voice && s.eq_ignore_ascii_case("open") => Some(ANGLE_MAX),
                Err(_) if surface == Surface::Voice && s.eq_ignore_ascii_case("close") => Some(ANGLE_MIN),
                Err(_) => None,
            }
        }
        _ => None,
    }
    .ok_or_else(invalid)?;

    if angle.is_finite() && (ANGLE_MIN..=ANGLE_MAX).contains(&angle) {
        Ok(angle)
    } else {
        Err(invalid())
    }
}

/// 按设备格式构建标准负载
pub fn build_payload(entry: &DeviceEntry, command: &DeviceCommand) -> Result<DevicePayload, DispatchError> {
    let action = command.action_for(entry.shape);

    match entry.shape {
        PayloadShape::Toggle => {
            let value = action.ok_or_else(|| DispatchError::MissingParameter("State is required".to_string()))?;
            Ok(DevicePayload::Toggle {
                state: coerce_toggle(value),
            })
        }
        PayloadShape::ServoCommand => {
            let command = parse_servo_command(action, command.surface)?;
            Ok(DevicePayload::Command { command })
        }
        PayloadShape::ServoAngle => {
            let angle = parse_angle(action, command.surface)?;
            Ok(DevicePayload::Angle { angle })
        }
    }
}

/// 校验命令并发布到对应主题
pub struct CommandDispatcher {
    registry: DeviceRegistry,
    mqtt: Arc<MqttConnectionManager>,
}

impl CommandDispatcher {
    pub fn new(registry: DeviceRegistry, mqtt: Arc<MqttConnectionManager>) -> Self {
        Self { registry, mqtt }
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt.is_connected()
    }

    pub async fn dispatch(&self, command: DeviceCommand) -> Result<Dispatched, DispatchError> {
        let entry = self
            .registry
            .resolve(&command.device)
            .ok_or_else(|| DispatchError::UnknownDevice(command.device.clone()))?;

        let payload = build_payload(entry, &command)?;

        if !self.mqtt.is_connected() {
            warn!(
                "Rejecting {} command, MQTT state is {}",
                entry.kind.display_name(),
                self.mqtt.current_state()
            );
            return Err(DispatchError::ServiceUnavailable);
        }

        let message = OutboundMessage::new(entry.topic.clone(), &payload).map_err(|source| {
            DispatchError::PublishFailed {
                device: entry.kind,
                source,
            }
        })?;

        match self.mqtt.publish(&message).await {
            Ok(()) => {
                info!("Published {} message: {}", entry.kind.display_name(), message.payload);
                Ok(Dispatched {
                    device: entry.kind,
                    shape: entry.shape,
                    topic: message.topic,
                    payload,
                })
            }
            Err(MqttError::NotConnected) | Err(MqttError::ShuttingDown) => Err(DispatchError::ServiceUnavailable),
            Err(source) => {
                error!("Error publishing {} message: {}", entry.kind.display_name(), source);
                Err(DispatchError::PublishFailed {
                    device: entry.kind,
                    source,
                })
            }
        }
    }
}
