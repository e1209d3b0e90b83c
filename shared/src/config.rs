use crate::mqtt::MqttConfig;
use crate::types::{AppConfig, DeviceProfileConfig, ServerConfig, ServoMode, TopicConfig};
use crate::utils::split_broker_url;
use anyhow::Result;
use config::{Config, Environment, File};
use dotenvy::dotenv;
use std::env;

// 旧部署使用的扁平环境变量
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("PORT", "server.port"),
    ("MQTT_BROKER", "mqtt.broker_host"),
    ("MQTT_PORT", "mqtt.broker_port"),
    ("MQTT_USERNAME", "mqtt.username"),
    ("MQTT_PASSWORD", "mqtt.password"),
    ("MQTT_TOPIC_FAN", "topics.fan"),
    ("MQTT_TOPIC_DOOR_SERVO", "topics.door_servo"),
    ("MQTT_TOPIC_CURTAIN_SERVO", "topics.curtain_servo"),
    ("MQTT_TOPIC_ROOM_LIGHT", "topics.room_light"),
    ("MQTT_TOPIC_READING_LAMP", "topics.reading_lamp"),
    ("MQTT_TOPIC_STATUS", "topics.status"),
    ("SERVO_MODE", "devices.servo_mode"),
];

pub fn load_config() -> Result<AppConfig> {
    // 加载 .env 文件
    dotenv().ok();

    let mut builder = Config::builder()
        // 内置默认值
        .add_source(Config::try_from(&AppConfig::default())?)
        // 添加默认配置文件
        .add_source(File::with_name("config/default").required(false))
        // 添加环境特定配置文件
        .add_source(
            File::with_name(&format!("config/{}", env::var("ENV").unwrap_or_else(|_| "development".to_string())))
                .required(false)
        )
        // 添加环境变量，使用 APP__ 前缀，例如 APP__MQTT__BROKER_HOST
        .add_source(Environment::with_prefix("APP").prefix_separator("__").separator("__"));

    for (var, key) in LEGACY_ENV_KEYS {
        builder = builder.set_override_option(*key, env::var(var).ok())?;
    }

    let mut config: AppConfig = builder.build()?.try_deserialize()?;

    normalize_broker(&mut config.mqtt);

    // 验证必要配置
    validate_config(&config)?;

    Ok(config)
}

/// 去掉 `mqtts://` 之类的协议前缀，地址里带的端口优先
pub fn normalize_broker(mqtt: &mut MqttConfig) {
    let (host, port) = split_broker_url(mqtt.broker_host.trim());
    mqtt.broker_host = host;
    if let Some(port) = port {
        mqtt.broker_port = port;
    }
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.mqtt.broker_host.is_empty() {
        return Err(anyhow::anyhow!("MQTT broker host cannot be empty"));
    }

    if config.mqtt.broker_port == 0 {
        return Err(anyhow::anyhow!("MQTT broker port cannot be 0"));
    }

    if config.mqtt.reconnect_interval_ms == 0 {
        return Err(anyhow::anyhow!("MQTT reconnect interval cannot be 0"));
    }

    let topics = [
        ("fan", &config.topics.fan),
        ("door_servo", &config.topics.door_servo),
        ("curtain_servo", &config.topics.curtain_servo),
        ("room_light", &config.topics.room_light),
        ("reading_lamp", &config.topics.reading_lamp),
        ("status", &config.topics.status),
    ];
    for (name, topic) in topics {
        if topic.trim().is_empty() {
            return Err(anyhow::anyhow!("MQTT topic for {} cannot be empty", name));
        }
    }

    if config.mqtt.username.is_none() || config.mqtt.password.is_none() {
        tracing::warn!("MQTT credentials are not configured, connecting anonymously");
    }

    Ok(())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                static_dir: Some("public".to_string()),
            },
            mqtt: MqttConfig::default(),
            topics: TopicConfig {
                fan: "home/fan".to_string(),
                door_servo: "home/servo/door".to_string(),
                curtain_servo: "home/servo/curtain".to_string(),
                room_light: "home/light/room".to_string(),
                reading_lamp: "home/light/reading".to_string(),
                status: "home/status".to_string(),
            },
            devices: DeviceProfileConfig {
                servo_mode: ServoMode::Command,
            },
        }
    }
}
