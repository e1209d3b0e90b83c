// HomeLink 共享类型与工具

pub mod config;
pub mod mqtt;
pub mod types;
pub mod utils;

pub use config::{load_config, validate_config};
pub use mqtt::{DevicePayload, MqttConfig, MqttError, OutboundMessage, QoS, ServoCommand, TopicFilter};
pub use types::{
    AppConfig, ConnectionState, DeviceProfileConfig, ErrorBody, HealthReport, ServerConfig, ServoMode,
    SuccessBody, TopicConfig,
};
pub use utils::{generate_client_id, iso_timestamp, now_utc, split_broker_url, truncate_string};
