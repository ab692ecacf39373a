use relay::controller::{ControllerConfig, RelayController};
use relay::delivery::{Delivery, DeliveryClient};
use relay::device::SystemDeviceInfo;
use relay::observer::Observer;
use relay::stream::{StreamConfig, StreamSource};
use relay::{metrics, rest};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(default),
    )
}

#[tokio::main]
async fn main() {
    let tenant_id = env::var("RELAY_TENANT_ID").unwrap_or_default();
    let endpoint = env::var("RELAY_ENDPOINT").unwrap_or_default();
    let api_key = env::var("RELAY_API_KEY").ok();
    let device_id = env::var("RELAY_DEVICE_ID").ok();
    let feed_addr = env::var("RELAY_FEED_ADDR").unwrap_or_else(|_| "127.0.0.1:9635".to_string());
    let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let battery_fallback: i32 = env::var("RELAY_BATTERY_LEVEL")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);

    // Initialize logging
    tracing_subscriber::fmt::init();

    if tenant_id.is_empty() {
        error!("RELAY_TENANT_ID is required");
        std::process::exit(1);
    }
    if endpoint.is_empty() {
        error!("RELAY_ENDPOINT is required");
        std::process::exit(1);
    }

    info!("Starting GNSS telemetry relay");
    info!("Tenant: {}", tenant_id);
    info!("Receiver feed: {}", feed_addr);
    info!("Endpoint: {}", endpoint);
    info!("Observer HTTP server: {}", http_addr);

    // Initialize metrics
    metrics::init_metrics();

    let mut config = ControllerConfig::new(tenant_id);
    config.delivery_cooldown = env_secs("RELAY_COOLDOWN_SECS", 300);
    config.offline_after = env_secs("RELAY_OFFLINE_AFTER_SECS", 600);
    config.heartbeat_interval = env_secs("RELAY_HEARTBEAT_SECS", 300);

    let device = Arc::new(SystemDeviceInfo::new(device_id, battery_fallback));
    let delivery = match DeliveryClient::new(endpoint, api_key) {
        Ok(client) => Arc::new(client) as Arc<dyn Delivery>,
        Err(e) => {
            error!("Failed to build delivery client: {}", e);
            std::process::exit(1);
        }
    };
    let observer = Observer::new();

    let source = Box::new(StreamSource::new(
        StreamConfig {
            addr: feed_addr,
            ..StreamConfig::default()
        },
        device.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let controller = RelayController::new(config, device, delivery, observer.clone());
    let mut relay_handle = tokio::spawn(controller.run(source, shutdown_rx));

    // Observer HTTP surface
    let app = rest::create_router(observer);
    let listener = match tokio::net::TcpListener::bind(&http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        }
    };

    info!("Observer HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = &mut relay_handle => {
            error!("Relay session terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(()).await;
            let _ = relay_handle.await;
        }
    }

    info!("Shutting down");
}
