use serde::{Deserialize, Serialize};

mod angle_serde {
    use serde::Serializer;

    // 整数角度按整数输出，固件端按整数解析
    pub fn serialize<S>(angle: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if angle.fract() == 0.0 && *angle >= 0.0 {
            serializer.serialize_u64(*angle as u64)
        } else {
            serializer.serialize_f64(*angle)
        }
    }
}

// MQTT 消息质量等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

// 舵机开关命令
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServoCommand {
    Open,
    Close,
}

/// 下发给设备的标准负载
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum DevicePayload {
    Toggle { state: bool },
    Command { command: ServoCommand },
    Angle {
        #[serde(with = "angle_serde")]
        angle: f64,
    },
}

// MQTT 出站消息，每次下发时构建
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: &DevicePayload) -> Result<Self, MqttError> {
        Ok(Self {
            topic: topic.into(),
            payload: serde_json::to_string(payload)?,
            qos: QoS::AtLeastOnce,
            retain: false,
        })
    }
}

// MQTT 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub use_tls: bool,
    pub reconnect_interval_ms: u64,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 8883,
            username: None,
            password: None,
            client_id_prefix: "server".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            use_tls: true,
            reconnect_interval_ms: 5000,
            publish_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

// MQTT 错误类型
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client is not connected")]
    NotConnected,

    #[error("MQTT client is shutting down")]
    ShuttingDown,

    #[error("Publish to {0} timed out")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish error: {0}")]
    Publish(String),
}

// 主题过滤器
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFilter {
    pub topic_pattern: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new(topic_pattern: String, qos: QoS) -> Self {
        Self {
            topic_pattern,
            qos,
        }
    }

    pub fn at_least_once(topic_pattern: &str) -> Self {
        Self::new(topic_pattern.to_string(), QoS::AtLeastOnce)
    }
}
