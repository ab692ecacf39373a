//! Stream feed source.
//!
//! Connects to the loopback streaming endpoint exposed by the co-located
//! receiver-management process and reads newline-delimited JSON frames. The
//! feed auto-pushes position frames on some versions and wants an explicit
//! subscribe on others, so a subscribe request is written best-effort on
//! connect and any rejection is ignored.

use crate::device::DeviceInfo;
use crate::errors::{Error, Result};
use crate::health::{basic_health, receiver_health, HealthThresholds};
use crate::metrics::{FRAMES_DROPPED_TOTAL, PARSE_ERRORS_TOTAL};
use crate::model::{SourceErrorCode, TelemetrySample};
use crate::source::{ReceiverSource, SessionContext, SourceError, SourceEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Feed address, loopback only.
    pub addr: String,
    /// Write the optional subscribe request after connecting.
    pub subscribe: bool,
    pub thresholds: HealthThresholds,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9635".to_string(),
            subscribe: true,
            thresholds: HealthThresholds::default(),
        }
    }
}

pub struct StreamSource {
    config: StreamConfig,
    device: Arc<dyn DeviceInfo>,
    task: Option<JoinHandle<()>>,
}

impl StreamSource {
    pub fn new(config: StreamConfig, device: Arc<dyn DeviceInfo>) -> Self {
        Self {
            config,
            device,
            task: None,
        }
    }
}

#[async_trait]
impl ReceiverSource for StreamSource {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn connect(&mut self, ctx: SessionContext, events: mpsc::Sender<SourceEvent>) {
        if self.task.is_some() {
            warn!("Stream source already connected, ignoring connect");
            return;
        }

        let config = self.config.clone();
        let device = self.device.clone();
        self.task = Some(tokio::spawn(run_stream(config, device, ctx, events)));
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!("Stream source closed");
        }
    }
}

async fn run_stream(
    config: StreamConfig,
    device: Arc<dyn DeviceInfo>,
    ctx: SessionContext,
    events: mpsc::Sender<SourceEvent>,
) {
    info!("Connecting to receiver feed at {}", config.addr);

    let stream = match TcpStream::connect(&config.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to connect to receiver feed: {}", e);
            let _ = events
                .send(SourceEvent::Error(SourceError::coded(
                    SourceErrorCode::ConnectionFailed,
                    format!("Failed to connect to receiver feed: {}", e),
                )))
                .await;
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();

    if config.subscribe {
        let subscribe = serde_json::json!({"type": "subscribe", "topic": "location"});
        let line = format!("{}\n", subscribe);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Subscribe request failed (safe to ignore): {}", e);
        } else {
            debug!("Sent optional subscribe request");
        }
    }

    info!("Connected to receiver feed");

    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }

                match parse_frame(&line, &ctx, device.battery_level(), &config.thresholds) {
                    Ok(Some(sample)) => {
                        if events.send(SourceEvent::Sample(sample)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        FRAMES_DROPPED_TOTAL.inc();
                        debug!("Frame without position fields, ignoring");
                    }
                    Err(e) => {
                        PARSE_ERRORS_TOTAL.inc();
                        warn!("Failed to parse feed frame: {}", e);
                        let failed = events
                            .send(SourceEvent::Error(SourceError::uncoded(format!(
                                "Failed to parse feed frame: {}",
                                e
                            ))))
                            .await
                            .is_err();
                        if failed {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                warn!("Receiver feed closed the connection");
                let _ = events
                    .send(SourceEvent::Error(SourceError::coded(
                        SourceErrorCode::ConnectionFailed,
                        "Receiver feed closed the connection",
                    )))
                    .await;
                break;
            }
            Err(e) => {
                error!("Receiver feed read error: {}", e);
                let _ = events
                    .send(SourceEvent::Error(SourceError::coded(
                        SourceErrorCode::ConnectionFailed,
                        format!("Receiver feed read error: {}", e),
                    )))
                    .await;
                break;
            }
        }
    }
}

/// Parse one feed frame.
///
/// Returns Ok(None) for non-positional frames (no latitude/longitude keys),
/// which are dropped without being an error. Individual malformed fields fall
/// back to their defaults; only an unparseable frame is an error.
fn parse_frame(
    text: &str,
    ctx: &SessionContext,
    device_battery: i32,
    thresholds: &HealthThresholds,
) -> Result<Option<TelemetrySample>> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Frame("frame is not a JSON object".to_string()))?;

    if !obj.contains_key("latitude") || !obj.contains_key("longitude") {
        return Ok(None);
    }

    let latitude = field_f64(obj, "latitude", 0.0);
    let longitude = field_f64(obj, "longitude", 0.0);
    let fix_type = field_string(obj, "fixType").unwrap_or_else(|| "NO_FIX".to_string());
    let horizontal_accuracy = field_f64(obj, "horizontalAccuracy", -1.0);
    let vertical_accuracy = field_f64(obj, "verticalAccuracy", -1.0);
    let satellites = field_i32(obj, "satellites", -1);
    let pdop = field_finite(obj, "pdop");
    let hdop = field_finite(obj, "hdop");
    let vdop = field_finite(obj, "vdop");

    // Battery-like feed fields describe the external receiver; the device
    // battery always comes from the local device.
    let receiver_battery = ["receiverBattery", "batteryLevel", "battery"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_i64))
        .map(|level| level as i32)
        .filter(|level| (0..=100).contains(level));

    let timestamp = field_string(obj, "timestamp")
        .and_then(|text| DateTime::parse_from_rfc3339(&text).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let user_id = field_string(obj, "userId").or_else(|| field_string(obj, "username"));
    let user_name = field_string(obj, "userName").or_else(|| field_string(obj, "name"));
    let user_email = field_string(obj, "userEmail").or_else(|| field_string(obj, "email"));

    let accuracy_or_hdop = if horizontal_accuracy >= 0.0 {
        Some(horizontal_accuracy)
    } else {
        hdop
    };

    Ok(Some(TelemetrySample {
        tenant_id: ctx.tenant_id.clone(),
        device_id: ctx.device_id.clone(),
        latitude,
        longitude,
        battery: device_battery,
        health: basic_health(device_battery, &fix_type, thresholds).to_string(),
        receiver_health: receiver_health(&fix_type, satellites, accuracy_or_hdop, thresholds)
            .to_string(),
        fix_type,
        timestamp,
        horizontal_accuracy,
        vertical_accuracy,
        satellites,
        receiver_battery,
        pdop,
        hdop,
        vdop,
        user_id,
        user_name,
        user_email,
    }))
}

fn field_f64(obj: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

fn field_i32(obj: &Map<String, Value>, key: &str, default: i32) -> i32 {
    match obj.get(key) {
        Some(Value::Number(n)) => n.as_i64().map(|v| v as i32).unwrap_or(default),
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

fn field_finite(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn field_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceErrorCode;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct FakeDevice;

    impl DeviceInfo for FakeDevice {
        fn device_id(&self) -> String {
            "dev-1".to_string()
        }

        fn battery_level(&self) -> i32 {
            80
        }
    }

    fn ctx() -> SessionContext {
        SessionContext {
            tenant_id: "tenant-1".to_string(),
            device_id: "dev-1".to_string(),
        }
    }

    fn parse(text: &str) -> Result<Option<TelemetrySample>> {
        parse_frame(text, &ctx(), 80, &HealthThresholds::default())
    }

    #[test]
    fn test_non_positional_frame_is_dropped() {
        assert!(parse(r#"{"type":"status","message":"ok"}"#).unwrap().is_none());
        assert!(parse(r#"{"latitude":26.1}"#).unwrap().is_none());
        assert!(parse(r#"{"longitude":91.7}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(parse("not json").is_err());
        assert!(parse("[1,2,3]").is_err());
    }

    #[test]
    fn test_full_frame() {
        let sample = parse(
            r#"{"latitude":26.1445,"longitude":91.7362,"fixType":"RTK_FIXED",
                "horizontalAccuracy":0.8,"verticalAccuracy":1.2,"satellites":12,
                "hdop":0.9,"pdop":1.5,"vdop":1.2,"receiverBattery":64,
                "timestamp":"2025-11-03T06:30:00Z","userId":"u-1"}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(sample.latitude, 26.1445);
        assert_eq!(sample.satellites, 12);
        assert_eq!(sample.receiver_battery, Some(64));
        assert_eq!(sample.receiver_health, "EXCELLENT");
        assert_eq!(sample.health, "OK");
        assert_eq!(sample.user_id.as_deref(), Some("u-1"));
        assert_eq!(sample.timestamp.to_rfc3339(), "2025-11-03T06:30:00+00:00");
    }

    #[test]
    fn test_per_field_defaults() {
        let sample = parse(r#"{"latitude":"garbage","longitude":91.7,"satellites":"x"}"#)
            .unwrap()
            .unwrap();

        assert_eq!(sample.latitude, 0.0);
        assert_eq!(sample.longitude, 91.7);
        assert_eq!(sample.fix_type, "NO_FIX");
        assert_eq!(sample.horizontal_accuracy, -1.0);
        assert_eq!(sample.satellites, -1);
        assert!(sample.pdop.is_none());
    }

    #[test]
    fn test_device_battery_never_comes_from_the_feed() {
        let sample = parse(r#"{"latitude":26.1,"longitude":91.7,"battery":12}"#)
            .unwrap()
            .unwrap();

        assert_eq!(sample.battery, 80);
        assert_eq!(sample.receiver_battery, Some(12));
    }

    #[test]
    fn test_out_of_range_receiver_battery_is_dropped() {
        let sample = parse(r#"{"latitude":26.1,"longitude":91.7,"batteryLevel":250}"#)
            .unwrap()
            .unwrap();

        assert!(sample.receiver_battery.is_none());
    }

    #[test]
    fn test_user_field_fallbacks() {
        let sample = parse(
            r#"{"latitude":26.1,"longitude":91.7,"username":"surveyor",
                "name":"A Surveyor","email":"s@example.org"}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(sample.user_id.as_deref(), Some("surveyor"));
        assert_eq!(sample.user_name.as_deref(), Some("A Surveyor"));
        assert_eq!(sample.user_email.as_deref(), Some("s@example.org"));
    }

    #[test]
    fn test_unparseable_timestamp_falls_back_to_capture_time() {
        let before = Utc::now();
        let sample = parse(r#"{"latitude":26.1,"longitude":91.7,"timestamp":"yesterday"}"#)
            .unwrap()
            .unwrap();

        assert!(sample.timestamp >= before);
    }

    #[tokio::test]
    async fn test_stream_source_reads_frames_and_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            let (reader, writer) = socket.split();
            let mut reader = BufReader::new(reader);
            reader.read_line(&mut line).await.unwrap();

            let mut writer = writer;
            writer
                .write_all(b"{\"latitude\":26.1,\"longitude\":91.7,\"fixType\":\"AUTONOMOUS\"}\n")
                .await
                .unwrap();
            writer
                .write_all(b"{\"type\":\"status\"}\n")
                .await
                .unwrap();
            writer.flush().await.unwrap();

            line
        });

        let mut source = StreamSource::new(
            StreamConfig {
                addr: addr.to_string(),
                ..StreamConfig::default()
            },
            Arc::new(FakeDevice),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SourceEvent::Sample(sample) => {
                assert_eq!(sample.latitude, 26.1);
                assert_eq!(sample.fix_type, "AUTONOMOUS");
            }
            other => panic!("expected sample, got {:?}", other),
        }

        // Server task ends and drops the socket; the source must surface a
        // single transport error, not a sample for the status frame.
        let subscribe_line = server.await.unwrap();
        assert!(subscribe_line.contains("subscribe"));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SourceEvent::Error(err) => {
                assert_eq!(err.code, Some(SourceErrorCode::ConnectionFailed));
            }
            other => panic!("expected error, got {:?}", other),
        }

        source.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut source = StreamSource::new(
            StreamConfig {
                addr: addr.to_string(),
                ..StreamConfig::default()
            },
            Arc::new(FakeDevice),
        );

        let (tx, _rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;
        source.close().await;
        source.close().await;
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_on_the_error_channel() {
        // Bind then drop to get an address with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut source = StreamSource::new(
            StreamConfig {
                addr: addr.to_string(),
                ..StreamConfig::default()
            },
            Arc::new(FakeDevice),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SourceEvent::Error(err) => {
                assert_eq!(err.code, Some(SourceErrorCode::ConnectionFailed));
            }
            other => panic!("expected error, got {:?}", other),
        }

        source.close().await;
    }
}
