use anyhow::Result;
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use homelink_shared::{load_config, ServerConfig};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod dispatcher;
mod handlers;
mod middleware;
mod mqtt;
mod registry;

use app_state::AppState;
use dispatcher::CommandDispatcher;
use handlers::devices::device_routes;
use middleware::{handle_panic, request_logging};
use mqtt::MqttConnectionManager;
use registry::DeviceRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 加载配置
    let config = load_config()?;
    info!("Configuration loaded successfully");

    let registry = DeviceRegistry::new(&config.topics, config.devices.servo_mode);
    for entry in registry.entries() {
        info!("Device {} -> {} ({:?})", entry.kind.display_name(), entry.topic, entry.shape);
    }

    // 创建 MQTT 客户端
    let mqtt_client = Arc::new(MqttConnectionManager::with_rumqttc(
        config.mqtt.clone(),
        registry.subscriptions(&config.topics.status),
    ));

    // 连接失败不影响启动，事件循环会继续重连
    info!("Starting MQTT client...");
    if let Err(e) = mqtt_client.connect().await {
        error!("MQTT connection setup failed: {}", e);
    }

    info!("Servo mode: {:?}", registry.servo_mode());
    let dispatcher = Arc::new(CommandDispatcher::new(registry, mqtt_client.clone()));
    let app_state = AppState::new(mqtt_client.clone(), dispatcher);

    // 构建应用
    let app = create_app(&config.server, app_state);

    // 启动服务器
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Server running at http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    mqtt_client.shutdown().await;

    Ok(())
}

fn create_app(server: &ServerConfig, app_state: AppState) -> Router {
    // 创建中间件层
    let middleware_layer = ServiceBuilder::new()
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(from_fn(request_logging))
        .into_inner();

    // 创建路由
    let api = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/fulfillment", post(handlers::fulfillment::fulfillment))
        .merge(device_routes());

    let mut app = Router::new().nest("/api", api);

    // 静态页面
    if let Some(static_dir) = &server.static_dir {
        app = app.fallback_service(ServeDir::new(static_dir));
    }

    app.layer(middleware_layer).with_state(app_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
