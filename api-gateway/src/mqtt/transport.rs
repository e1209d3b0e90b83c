use async_trait::async_trait;
use homelink_shared::{
    generate_client_id, truncate_string, ConnectionState, MqttConfig, MqttError, OutboundMessage, QoS,
    TopicFilter,
};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS as RumqttQoS, SubscribeReasonCode,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 16;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// 打开一条到 broker 的连接。连接管理器只通过这个接口访问底层客户端。
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(
        &self,
        config: &MqttConfig,
        subscriptions: &[TopicFilter],
        state: StateReporter,
    ) -> Result<Box<dyn BrokerSession>, MqttError>;
}

/// 一条已打开的 broker 连接
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// 客户端库接收消息后返回
    async fn publish(&self, message: &OutboundMessage) -> Result<(), MqttError>;

    async fn close(&mut self);
}

/// 连接状态回写句柄。连接被替换后，旧句柄的写入会被丢弃。
#[derive(Clone)]
pub struct StateReporter {
    state: Arc<watch::Sender<ConnectionState>>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
}

impl StateReporter {
    pub(crate) fn new(
        state: Arc<watch::Sender<ConnectionState>>,
        current_generation: Arc<AtomicU64>,
        generation: u64,
    ) -> Self {
        Self {
            state,
            current_generation,
            generation,
        }
    }

    pub fn set(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if self.is_stale() || *state == next {
                return false;
            }
            debug!("MQTT connection state: {} -> {}", state, next);
            *state = next;
            true
        })
    }

    pub fn is_stale(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) != self.generation
    }
}

pub fn to_rumqtt_qos(qos: QoS) -> RumqttQoS {
    match qos {
        QoS::AtMostOnce => RumqttQoS::AtMostOnce,
        QoS::AtLeastOnce => RumqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => RumqttQoS::ExactlyOnce,
    }
}

// rumqttc 实现
pub struct RumqttConnector;

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn open(
        &self,
        config: &MqttConfig,
        subscriptions: &[TopicFilter],
        state: StateReporter,
    ) -> Result<Box<dyn BrokerSession>, MqttError> {
        let client_id = generate_client_id(&config.client_id_prefix);
        let mut mqtt_options = MqttOptions::new(client_id.clone(), config.broker_host.clone(), config.broker_port);

        // 设置认证信息
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
        mqtt_options.set_clean_session(config.clean_session);

        if config.use_tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let online = Arc::new(AtomicBool::new(false));

        info!(
            "Opening MQTT session {} to {}:{} (tls: {})",
            client_id, config.broker_host, config.broker_port, config.use_tls
        );

        let task = tokio::spawn(run_event_loop(
            client.clone(),
            event_loop,
            subscriptions.to_vec(),
            state,
            online.clone(),
            Duration::from_millis(config.reconnect_interval_ms),
            cancel.clone(),
        ));

        Ok(Box::new(RumqttSession {
            client,
            cancel,
            online,
            task: Some(task),
        }))
    }
}

pub struct RumqttSession {
    client: AsyncClient,
    cancel: CancellationToken,
    // 事件循环在 ConnAck 后置位，断开或出错时清除
    online: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), MqttError> {
        self.client
            .publish(
                message.topic.clone(),
                to_rumqtt_qos(message.qos),
                message.retain,
                message.payload.clone().into_bytes(),
            )
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }

    async fn close(&mut self) {
        // 未连接时 DISCONNECT 发不出去，直接停止事件循环
        if self.online.load(Ordering::SeqCst) {
            match tokio::time::timeout(CLOSE_GRACE, self.client.disconnect()).await {
                Ok(Ok(())) => debug!("MQTT disconnect requested"),
                Ok(Err(e)) => warn!("Failed to request MQTT disconnect: {}", e),
                Err(_) => warn!("Timed out requesting MQTT disconnect"),
            }
        } else {
            debug!("MQTT session is offline, stopping event loop");
            self.cancel.cancel();
        }

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting");
                self.cancel.cancel();
                task.abort();
            }
        }
        self.cancel.cancel();
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 将 SUBSCRIBE 报文 id 对应回主题，便于按主题记录订阅结果
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    queued: VecDeque<String>,
    in_flight: HashMap<u16, String>,
}

impl SubscriptionTracker {
    pub fn reset(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }

    pub fn queued(&mut self, topic: &str) {
        self.queued.push_back(topic.to_string());
    }

    pub fn sent(&mut self, pkid: u16) {
        if let Some(topic) = self.queued.pop_front() {
            self.in_flight.insert(pkid, topic);
        }
    }

    pub fn acknowledged(&mut self, pkid: u16) -> Option<String> {
        self.in_flight.remove(&pkid)
    }
}

fn request_subscriptions(client: &AsyncClient, subscriptions: &[TopicFilter], tracker: &mut SubscriptionTracker) {
    tracker.reset();
    for filter in subscriptions {
        match client.try_subscribe(filter.topic_pattern.clone(), to_rumqtt_qos(filter.qos)) {
            Ok(()) => tracker.queued(&filter.topic_pattern),
            Err(e) => error!("Failed to subscribe to {}: {}", filter.topic_pattern, e),
        }
    }
}

// 运行事件循环；rumqttc 在下一次 poll 时自动重连
async fn run_event_loop(
    client: AsyncClient,
    mut event_loop: EventLoop,
    subscriptions: Vec<TopicFilter>,
    state: StateReporter,
    online: Arc<AtomicBool>,
    reconnect_interval: Duration,
    cancel: CancellationToken,
) {
    info!("Starting MQTT event loop");
    let mut tracker = SubscriptionTracker::default();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                info!("Connected to MQTT broker ({:?})", connack.code);
                online.store(true, Ordering::SeqCst);
                state.set(ConnectionState::Connected);
                request_subscriptions(&client, &subscriptions, &mut tracker);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                info!("Received message on {}: {}", publish.topic, truncate_string(&payload, 512));
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let topic = tracker
                    .acknowledged(suback.pkid)
                    .unwrap_or_else(|| format!("<pkid {}>", suback.pkid));
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!("Failed to subscribe to {}: rejected by broker", topic);
                } else {
                    info!("Subscribed to {}", topic);
                }
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                debug!("Publish acknowledged: {}", puback.pkid);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker closed the connection");
                online.store(false, Ordering::SeqCst);
                state.set(ConnectionState::Disconnected);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                tracker.sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect sent");
                online.store(false, Ordering::SeqCst);
                state.set(ConnectionState::Disconnected);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT Error: {}", e);
                online.store(false, Ordering::SeqCst);
                state.set(ConnectionState::Error);

                warn!(
                    "Reconnecting to MQTT broker in {}ms",
                    reconnect_interval.as_millis()
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
                state.set(ConnectionState::Connecting);
            }
        }
    }

    info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::test_mqtt_config;
    use crate::mqtt::MqttConnectionManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    fn reporter(generation: u64) -> (StateReporter, Arc<watch::Sender<ConnectionState>>, Arc<AtomicU64>) {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        let tx = Arc::new(tx);
        let current = Arc::new(AtomicU64::new(generation));
        (StateReporter::new(tx.clone(), current.clone(), generation), tx, current)
    }

    #[test]
    fn test_reporter_updates_state() {
        let (reporter, tx, _current) = reporter(1);

        assert!(reporter.set(ConnectionState::Connected));
        assert_eq!(*tx.borrow(), ConnectionState::Connected);
        // 相同状态不重复通知
        assert!(!reporter.set(ConnectionState::Connected));
    }

    #[test]
    fn test_stale_reporter_is_ignored() {
        let (reporter, tx, current) = reporter(1);
        current.store(2, Ordering::SeqCst);

        assert!(reporter.is_stale());
        assert!(!reporter.set(ConnectionState::Connected));
        assert_eq!(*tx.borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_subscription_tracker_maps_pkids() {
        let mut tracker = SubscriptionTracker::default();
        tracker.queued("home/fan");
        tracker.queued("home/status");

        tracker.sent(7);
        tracker.sent(8);

        assert_eq!(tracker.acknowledged(8), Some("home/status".to_string()));
        assert_eq!(tracker.acknowledged(7), Some("home/fan".to_string()));
        assert_eq!(tracker.acknowledged(7), None);
    }

    #[test]
    fn test_subscription_tracker_reset() {
        let mut tracker = SubscriptionTracker::default();
        tracker.queued("home/fan");
        tracker.reset();
        tracker.sent(1);

        assert_eq!(tracker.acknowledged(1), None);
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_rumqtt_qos(QoS::AtLeastOnce), RumqttQoS::AtLeastOnce);
        assert_eq!(to_rumqtt_qos(QoS::AtMostOnce), RumqttQoS::AtMostOnce);
    }

    // 本地 MQTT 3.1.1 端点：应答 CONNECT / SUBSCRIBE / PINGREQ，记录收到的报文
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header).await?;

        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await?;
            remaining |= ((byte[0] & 0x7f) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header[0] >> 4, body))
    }

    async fn serve_one_client(listener: TcpListener, seen: mpsc::UnboundedSender<(u8, Vec<u8>)>) {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };

        while let Ok((kind, body)) = read_packet(&mut stream).await {
            let reply = match kind {
                PACKET_CONNECT => Some(vec![0x20, 0x02, 0x00, 0x00]),
                PACKET_SUBSCRIBE => Some(vec![0x90, 0x03, body[0], body[1], 0x01]),
                PACKET_PINGREQ => Some(vec![0xd0, 0x00]),
                _ => None,
            };
            let _ = seen.send((kind, body));

            if let Some(reply) = reply {
                if stream.write_all(&reply).await.is_err() {
                    break;
                }
            }
            if kind == PACKET_DISCONNECT {
                break;
            }
        }
    }

    const PACKET_CONNECT: u8 = 1;
    const PACKET_SUBSCRIBE: u8 = 8;
    const PACKET_PINGREQ: u8 = 12;
    const PACKET_DISCONNECT: u8 = 14;

    fn subscribed_topic(body: &[u8]) -> String {
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        String::from_utf8(body[4..4 + len].to_vec()).unwrap()
    }

    fn local_config(port: u16) -> MqttConfig {
        let mut config = test_mqtt_config();
        config.broker_host = "127.0.0.1".to_string();
        config.broker_port = port;
        config.use_tls = false;
        config.reconnect_interval_ms = 100;
        config.connect_timeout_ms = 2000;
        config
    }

    #[tokio::test]
    async fn test_refused_broker_keeps_retrying_until_shutdown() {
        // 取一个空闲端口后立即释放，连接会被拒绝
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let manager = MqttConnectionManager::with_rumqttc(
            local_config(port),
            vec![TopicFilter::at_least_once("home/fan")],
        );
        let mut changes = manager.state_changes();

        manager.connect().await.unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Error);
        changes.borrow_and_update();

        // 状态只在变化时写入，每次重新观察到 Error 都意味着经过了一次 Connecting
        let mut errors = 0;
        let cycled = tokio::time::timeout(Duration::from_secs(5), async {
            while errors < 3 {
                if changes.changed().await.is_err() {
                    break;
                }
                let state = *changes.borrow_and_update();
                assert_ne!(state, ConnectionState::Connected);
                if state == ConnectionState::Error {
                    errors += 1;
                }
            }
        })
        .await;
        assert!(cycled.is_ok());
        assert_eq!(errors, 3);

        let started = std::time::Instant::now();
        manager.shutdown().await;
        assert!(started.elapsed() < CLOSE_GRACE);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_session_subscribes_and_disconnects_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let broker = tokio::spawn(serve_one_client(listener, seen_tx));

        let manager = MqttConnectionManager::with_rumqttc(
            local_config(port),
            vec![
                TopicFilter::at_least_once("home/fan"),
                TopicFilter::at_least_once("home/status"),
            ],
        );

        manager.connect().await.unwrap();
        assert_eq!(manager.current_state(), ConnectionState::Connected);

        manager.shutdown().await;
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        tokio::time::timeout(Duration::from_secs(2), broker)
            .await
            .unwrap()
            .unwrap();

        let mut kinds = Vec::new();
        let mut topics = Vec::new();
        while let Ok((kind, body)) = seen_rx.try_recv() {
            if kind == PACKET_SUBSCRIBE {
                topics.push(subscribed_topic(&body));
            }
            kinds.push(kind);
        }

        assert_eq!(kinds.first(), Some(&PACKET_CONNECT));
        assert_eq!(kinds.last(), Some(&PACKET_DISCONNECT));
        assert_eq!(topics, vec!["home/fan", "home/status"]);
    }
}
