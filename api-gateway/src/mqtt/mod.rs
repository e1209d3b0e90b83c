// MQTT 连接管理
// 单一 broker 连接：连接、订阅、自动重连和发布

pub mod client;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use client::MqttConnectionManager;
