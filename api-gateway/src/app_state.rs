use std::sync::Arc;

use crate::dispatcher::CommandDispatcher;
use crate::mqtt::MqttConnectionManager;

/// 应用程序状态
#[derive(Clone)]
pub struct AppState {
    /// Broker 连接
    pub mqtt: Arc<MqttConnectionManager>,
    /// 命令下发
    pub dispatcher: Arc<CommandDispatcher>,
}

impl AppState {
    pub fn new(mqtt: Arc<MqttConnectionManager>, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self { mqtt, dispatcher }
    }
}
