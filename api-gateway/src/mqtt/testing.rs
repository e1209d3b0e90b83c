// 测试用的假 broker，记录连接和发布
use async_trait::async_trait;
use homelink_shared::{ConnectionState, MqttConfig, MqttError, OutboundMessage, TopicFilter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::{BrokerConnector, BrokerSession, StateReporter};

pub fn test_mqtt_config() -> MqttConfig {
    MqttConfig {
        broker_host: "broker.test".to_string(),
        broker_port: 8883,
        username: Some("gateway".to_string()),
        password: Some("secret".to_string()),
        connect_timeout_ms: 200,
        ..MqttConfig::default()
    }
}

#[derive(Default)]
pub struct FakeBroker {
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    refuse_handshake: AtomicBool,
    fail_open: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay_ms: AtomicU64,
    published: Mutex<Vec<OutboundMessage>>,
    subscriptions: Mutex<Vec<TopicFilter>>,
    reporters: Mutex<Vec<StateReporter>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    pub fn refuse_handshake(&self, refuse: bool) {
        self.refuse_handshake.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn publish_delay(&self, delay: Duration) {
        self.publish_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|filter| filter.topic_pattern.clone())
            .collect()
    }

    pub fn reporter(&self, index: usize) -> Option<StateReporter> {
        self.reporters.lock().unwrap().get(index).cloned()
    }

    /// 模拟连接断开
    pub fn drop_connection(&self) {
        if let Some(reporter) = self.reporters.lock().unwrap().last() {
            reporter.set(ConnectionState::Error);
        }
    }
}

struct FakeConnector {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn open(
        &self,
        _config: &MqttConfig,
        subscriptions: &[TopicFilter],
        state: StateReporter,
    ) -> Result<Box<dyn BrokerSession>, MqttError> {
        if self.broker.fail_open.load(Ordering::SeqCst) {
            return Err(MqttError::Connection("connection refused".to_string()));
        }

        self.broker.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.broker.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.broker.max_live.fetch_max(live, Ordering::SeqCst);

        if self.broker.refuse_handshake.load(Ordering::SeqCst) {
            state.set(ConnectionState::Error);
        } else {
            state.set(ConnectionState::Connected);
            *self.broker.subscriptions.lock().unwrap() = subscriptions.to_vec();
        }
        self.broker.reporters.lock().unwrap().push(state);

        Ok(Box::new(FakeSession {
            broker: self.broker.clone(),
            open: true,
        }))
    }
}

struct FakeSession {
    broker: Arc<FakeBroker>,
    open: bool,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), MqttError> {
        let delay = self.broker.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.broker.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::Publish("broker rejected message".to_string()));
        }

        self.broker.published.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.broker.closed.fetch_add(1, Ordering::SeqCst);
            self.broker.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
