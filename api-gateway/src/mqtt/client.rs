use homelink_shared::{ConnectionState, MqttConfig, MqttError, OutboundMessage, TopicFilter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::transport::{BrokerConnector, BrokerSession, RumqttConnector, StateReporter};

/// 网关唯一的 broker 连接。
///
/// 状态只由这里（以及当前连接的 [`StateReporter`]）修改；读取是无锁快照。
/// 重连期间发布会直接失败，不会等待。
pub struct MqttConnectionManager {
    config: MqttConfig,
    subscriptions: Vec<TopicFilter>,
    connector: Arc<dyn BrokerConnector>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    session: RwLock<Option<Box<dyn BrokerSession>>>,
    shutting_down: AtomicBool,
}

impl MqttConnectionManager {
    pub fn new(
        config: MqttConfig,
        subscriptions: Vec<TopicFilter>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            subscriptions,
            connector,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            session: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_rumqttc(config: MqttConfig, subscriptions: Vec<TopicFilter>) -> Self {
        Self::new(config, subscriptions, Arc::new(RumqttConnector))
    }

    // 建立连接：先关闭旧连接，再打开新连接
    pub async fn connect(&self) -> Result<(), MqttError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MqttError::ShuttingDown);
        }

        // 先让旧连接的状态回写失效，再标记为连接中，挡住新的发布
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connecting);

        let mut slot = self.session.write().await;
        if let Some(mut previous) = slot.take() {
            info!("Closing previous MQTT connection");
            previous.close().await;
        }

        info!(
            "Connecting to MQTT broker: {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        let reporter = StateReporter::new(self.state.clone(), self.generation.clone(), generation);
        match self.connector.open(&self.config, &self.subscriptions, reporter).await {
            Ok(session) => {
                *slot = Some(session);
            }
            Err(e) => {
                error!("Failed to open MQTT connection: {}", e);
                self.state.send_replace(ConnectionState::Error);
                return Err(e);
            }
        }
        drop(slot);

        self.wait_for_handshake().await;
        Ok(())
    }

    // 等待首次握手结果；失败时由事件循环继续重试
    async fn wait_for_handshake(&self) {
        let mut receiver = self.state.subscribe();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let outcome = tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        match outcome {
            Ok(Ok(state)) if state.is_connected() => {
                debug!("MQTT handshake completed");
            }
            Ok(Ok(state)) => {
                warn!(
                    "MQTT handshake failed (state: {}), retrying every {}ms",
                    *state, self.config.reconnect_interval_ms
                );
            }
            Ok(Err(_)) => {
                warn!("MQTT state channel closed while waiting for handshake");
            }
            Err(_) => {
                warn!(
                    "MQTT handshake not completed after {}ms, continuing in background",
                    self.config.connect_timeout_ms
                );
            }
        }
    }

    // 发布消息
    pub async fn publish(&self, message: &OutboundMessage) -> Result<(), MqttError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MqttError::ShuttingDown);
        }

        if !self.current_state().is_connected() {
            return Err(MqttError::NotConnected);
        }

        // 重连持有写锁时不等待
        let slot = self.session.try_read().map_err(|_| MqttError::NotConnected)?;
        let session = slot.as_ref().ok_or(MqttError::NotConnected)?;

        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        match tokio::time::timeout(timeout, session.publish(message)).await {
            Ok(Ok(())) => {
                debug!("Published MQTT message to topic: {}", message.topic);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::Timeout(message.topic.clone())),
        }
    }

    // 检查连接状态
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state().is_connected()
    }

    #[cfg(test)]
    pub(crate) fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    // 关闭连接，之后拒绝 connect 和 publish
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.session.write().await;
        if let Some(mut session) = slot.take() {
            session.close().await;
        }
        self.state.send_replace(ConnectionState::Disconnected);

        info!("MQTT connection closed");
    }
}
