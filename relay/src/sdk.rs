//! Vendor positioning SDK source.
//!
//! The vendor SDK is opaque and reachable only through the [`PositioningSdk`]
//! capability trait; loading and licensing the real driver is a packaging
//! concern outside this crate. Call sequencing is strict: credentials load
//! before driver init, init before listener registration, registration before
//! connect. Every vendor call is blocking and runs on the blocking pool.
//!
//! Listener callbacks deliver four independent event kinds. The adapter keeps
//! the latest of each kind and emits a combined sample whenever a position or
//! satellite event arrives while a position is cached. The driver reporting
//! success only makes the session "driver-ready"; it counts as connected once
//! the first data event arrives, and a configurable window without any data
//! surfaces a connection failure even if every vendor call succeeded.

use crate::device::DeviceInfo;
use crate::health::{overall_health, receiver_health, HealthThresholds};
use crate::model::{SourceErrorCode, TelemetrySample};
use crate::source::{ReceiverSource, SessionContext, SourceError, SourceEvent};
use async_trait::async_trait;
use chrono::Utc;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result code of a vendor capability call. `name` carries the vendor's code
/// identifier (e.g. "ErrorNoLicense") used for error mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkCode {
    name: String,
}

impl SdkCode {
    pub fn success() -> Self {
        Self {
            name: "Success".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_success(&self) -> bool {
        self.name.eq_ignore_ascii_case("success")
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Raw position event as delivered by the vendor driver. Angles are radians;
/// precision and DOP fields are NaN when the driver does not report them.
#[derive(Debug, Clone)]
pub struct SdkPosition {
    pub latitude_rad: f64,
    pub longitude_rad: f64,
    pub solution: String,
    pub horizontal_precision: f64,
    pub vertical_precision: f64,
    pub pdop: f64,
    pub hdop: f64,
    pub vdop: f64,
}

#[derive(Debug, Clone)]
pub struct SdkPower {
    pub battery_level: i32,
    pub charging: bool,
}

/// Listener events, one tagged union instead of four ad hoc callbacks.
#[derive(Debug, Clone)]
pub enum SdkEvent {
    Position(SdkPosition),
    Satellites { in_view: i32 },
    Power(SdkPower),
    SensorState { error: bool, description: String },
}

/// Capability view of the vendor positioning SDK. Every call is blocking and
/// returns a coded result rather than panicking or throwing.
pub trait PositioningSdk: Send {
    fn load_credentials(&mut self) -> SdkCode;
    fn init_driver(&mut self) -> SdkCode;
    fn register_listener(&mut self, events: mpsc::UnboundedSender<SdkEvent>) -> SdkCode;
    fn connect(&mut self) -> SdkCode;
    fn disconnect(&mut self) -> SdkCode;
    fn release(&mut self) -> SdkCode;
}

#[derive(Debug, Clone)]
pub struct SdkSourceConfig {
    /// How long the driver may stay silent after connect before connectivity
    /// is considered lost.
    pub data_timeout: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for SdkSourceConfig {
    fn default() -> Self {
        Self {
            data_timeout: Duration::from_secs(30),
            thresholds: HealthThresholds::default(),
        }
    }
}

pub struct SdkSource {
    config: SdkSourceConfig,
    device: Arc<dyn DeviceInfo>,
    sdk: Option<Box<dyn PositioningSdk>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SdkSource {
    pub fn new(
        config: SdkSourceConfig,
        device: Arc<dyn DeviceInfo>,
        sdk: Box<dyn PositioningSdk>,
    ) -> Self {
        Self {
            config,
            device,
            sdk: Some(sdk),
            shutdown: None,
            task: None,
        }
    }
}

#[async_trait]
impl ReceiverSource for SdkSource {
    fn name(&self) -> &'static str {
        "sdk"
    }

    async fn connect(&mut self, ctx: SessionContext, events: mpsc::Sender<SourceEvent>) {
        let sdk = match self.sdk.take() {
            Some(sdk) => sdk,
            None => {
                warn!("SDK source already connected, ignoring connect");
                return;
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_sdk(
            self.config.clone(),
            self.device.clone(),
            sdk,
            ctx,
            events,
            shutdown_rx,
        )));
    }

    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
            debug!("SDK source closed");
        }
        // Clears the unused driver when connect never ran.
        self.sdk = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum SdkStep {
    LoadCredentials,
    InitDriver,
    RegisterListener,
    Connect,
}

impl SdkStep {
    fn describe(&self) -> &'static str {
        match self {
            SdkStep::LoadCredentials => "Credential load",
            SdkStep::InitDriver => "Driver init",
            SdkStep::RegisterListener => "Listener registration",
            SdkStep::Connect => "Receiver connect",
        }
    }
}

/// Map a failed vendor code to a structured error by case-insensitive
/// substring match on the code name, with a per-step fallback.
fn map_vendor_code(step: SdkStep, code: &SdkCode) -> SourceError {
    let name = code.name().to_ascii_lowercase();

    let mapped = if name.contains("license") {
        SourceErrorCode::NotLicensed
    } else if name.contains("subscription") || name.contains("expired") {
        SourceErrorCode::NoSubscription
    } else if name.contains("bluetooth") || name.contains("permission") {
        SourceErrorCode::NoBluetoothPermission
    } else if name.contains("notsupported") || name.contains("not_supported") {
        SourceErrorCode::ReceiverNotSupported
    } else if name.contains("connect") {
        SourceErrorCode::ConnectionFailed
    } else {
        match step {
            SdkStep::LoadCredentials => SourceErrorCode::NoSubscription,
            _ => SourceErrorCode::ReceiverNotSupported,
        }
    };

    SourceError::coded(
        mapped,
        format!("{} failed with code {}", step.describe(), code.name()),
    )
}

/// Latest value of each listener event kind.
#[derive(Default)]
struct SdkCache {
    position: Option<SdkPosition>,
    satellites_in_view: Option<i32>,
    power: Option<SdkPower>,
    sensor_error: bool,
}

async fn run_sdk(
    config: SdkSourceConfig,
    device: Arc<dyn DeviceInfo>,
    sdk: Box<dyn PositioningSdk>,
    ctx: SessionContext,
    events: mpsc::Sender<SourceEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (listener_tx, mut listener_rx) = mpsc::unbounded_channel();

    info!("Starting vendor driver");

    let setup = tokio::task::spawn_blocking(move || {
        let mut sdk = sdk;

        let code = sdk.load_credentials();
        if !code.is_success() {
            return (sdk, Err(map_vendor_code(SdkStep::LoadCredentials, &code)));
        }

        let code = sdk.init_driver();
        if !code.is_success() {
            return (sdk, Err(map_vendor_code(SdkStep::InitDriver, &code)));
        }

        let code = sdk.register_listener(listener_tx);
        if !code.is_success() {
            return (sdk, Err(map_vendor_code(SdkStep::RegisterListener, &code)));
        }

        let code = sdk.connect();
        if !code.is_success() {
            return (sdk, Err(map_vendor_code(SdkStep::Connect, &code)));
        }

        (sdk, Ok(()))
    })
    .await;

    let (sdk, setup_result) = match setup {
        Ok(result) => result,
        Err(e) => {
            error!("Vendor driver task failed: {}", e);
            let _ = events
                .send(SourceEvent::Error(SourceError::uncoded(format!(
                    "Vendor driver task failed: {}",
                    e
                ))))
                .await;
            return;
        }
    };

    if let Err(source_error) = setup_result {
        error!("Vendor driver setup failed: {}", source_error);
        let _ = events.send(SourceEvent::Error(source_error)).await;
        teardown(sdk, false).await;
        return;
    }

    info!("Vendor driver ready, waiting for first data event");

    let mut cache = SdkCache::default();
    let mut connected = false;
    let mut stale_notified = false;
    let data_deadline = tokio::time::Instant::now() + config.data_timeout;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                break;
            }
            event = listener_rx.recv() => match event {
                Some(event) => {
                    if !connected {
                        connected = true;
                        info!("First data event received, receiver connected");
                    }
                    handle_event(&config, device.as_ref(), &ctx, &mut cache, event, &events).await;
                }
                None => {
                    warn!("Vendor event stream ended");
                    let _ = events
                        .send(SourceEvent::Error(SourceError::coded(
                            SourceErrorCode::ConnectionFailed,
                            "Vendor event stream ended",
                        )))
                        .await;
                    break;
                }
            },
            _ = tokio::time::sleep_until(data_deadline), if !connected && !stale_notified => {
                stale_notified = true;
                warn!(
                    "No data from receiver within {:?} of driver connect",
                    config.data_timeout
                );
                let _ = events
                    .send(SourceEvent::Error(SourceError::coded(
                        SourceErrorCode::ConnectionFailed,
                        format!(
                            "No data from receiver within {:?} of driver connect",
                            config.data_timeout
                        ),
                    )))
                    .await;
                // Keep listening; the driver may still deliver late data.
            }
        }
    }

    teardown(sdk, true).await;
}

async fn handle_event(
    config: &SdkSourceConfig,
    device: &dyn DeviceInfo,
    ctx: &SessionContext,
    cache: &mut SdkCache,
    event: SdkEvent,
    events: &mpsc::Sender<SourceEvent>,
) {
    let emit = match event {
        SdkEvent::Position(position) => {
            debug!(
                "Position event: solution={} hp={}",
                position.solution, position.horizontal_precision
            );
            cache.position = Some(position);
            true
        }
        SdkEvent::Satellites { in_view } => {
            debug!("Satellite event: {} in view", in_view);
            cache.satellites_in_view = Some(in_view);
            cache.position.is_some()
        }
        SdkEvent::Power(power) => {
            debug!("Power event: {}%", power.battery_level);
            cache.power = Some(power);
            false
        }
        SdkEvent::SensorState { error, description } => {
            debug!("Sensor state event: error={} ({})", error, description);
            cache.sensor_error = error;
            false
        }
    };

    if !emit {
        return;
    }

    if let Some(sample) = combined_sample(config, device, ctx, cache) {
        let _ = events.send(SourceEvent::Sample(sample)).await;
    }
}

fn combined_sample(
    config: &SdkSourceConfig,
    device: &dyn DeviceInfo,
    ctx: &SessionContext,
    cache: &SdkCache,
) -> Option<TelemetrySample> {
    let position = cache.position.as_ref()?;

    let latitude = position.latitude_rad * 180.0 / PI;
    let longitude = position.longitude_rad * 180.0 / PI;
    let satellites = cache.satellites_in_view.unwrap_or(-1);
    let horizontal_accuracy = finite_or(position.horizontal_precision, -1.0);
    let vertical_accuracy = finite_or(position.vertical_precision, -1.0);
    let hdop = finite(position.hdop);

    let accuracy_or_hdop = if horizontal_accuracy >= 0.0 {
        Some(horizontal_accuracy)
    } else {
        hdop
    };

    let receiver_battery = cache
        .power
        .as_ref()
        .map(|power| power.battery_level)
        .filter(|level| (0..=100).contains(level));

    Some(TelemetrySample {
        tenant_id: ctx.tenant_id.clone(),
        device_id: ctx.device_id.clone(),
        latitude,
        longitude,
        battery: device.battery_level(),
        health: overall_health(
            latitude,
            longitude,
            &position.solution,
            satellites,
            cache.sensor_error,
            &config.thresholds,
        )
        .to_string(),
        receiver_health: receiver_health(
            &position.solution,
            satellites,
            accuracy_or_hdop,
            &config.thresholds,
        )
        .to_string(),
        fix_type: position.solution.clone(),
        timestamp: Utc::now(),
        horizontal_accuracy,
        vertical_accuracy,
        satellites,
        receiver_battery,
        pdop: finite(position.pdop),
        hdop,
        vdop: finite(position.vdop),
        user_id: None,
        user_name: None,
        user_email: None,
    })
}

fn finite(value: f64) -> Option<f64> {
    Some(value).filter(|v| v.is_finite())
}

fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Release vendor resources; disconnect only when the connect step succeeded.
async fn teardown(sdk: Box<dyn PositioningSdk>, disconnect: bool) {
    let result = tokio::task::spawn_blocking(move || {
        let mut sdk = sdk;

        if disconnect {
            let code = sdk.disconnect();
            if !code.is_success() {
                debug!("Vendor disconnect returned {}", code.name());
            }
        }

        let code = sdk.release();
        if !code.is_success() {
            debug!("Vendor release returned {}", code.name());
        }
    })
    .await;

    if let Err(e) = result {
        error!("Vendor teardown task failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedSdk {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_at: Option<(&'static str, &'static str)>,
        listener: Option<mpsc::UnboundedSender<SdkEvent>>,
        feed: Vec<SdkEvent>,
    }

    impl ScriptedSdk {
        fn new(calls: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                calls,
                fail_at: None,
                listener: None,
                feed: Vec::new(),
            }
        }

        fn failing(calls: Arc<Mutex<Vec<&'static str>>>, call: &'static str, code: &'static str) -> Self {
            Self {
                fail_at: Some((call, code)),
                ..Self::new(calls)
            }
        }

        fn with_feed(calls: Arc<Mutex<Vec<&'static str>>>, feed: Vec<SdkEvent>) -> Self {
            Self {
                feed,
                ..Self::new(calls)
            }
        }

        fn record(&mut self, call: &'static str) -> SdkCode {
            self.calls.lock().unwrap().push(call);
            match self.fail_at {
                Some((fail_call, code)) if fail_call == call => SdkCode::named(code),
                _ => SdkCode::success(),
            }
        }
    }

    impl PositioningSdk for ScriptedSdk {
        fn load_credentials(&mut self) -> SdkCode {
            self.record("load_credentials")
        }

        fn init_driver(&mut self) -> SdkCode {
            self.record("init_driver")
        }

        fn register_listener(&mut self, events: mpsc::UnboundedSender<SdkEvent>) -> SdkCode {
            self.listener = Some(events);
            self.record("register_listener")
        }

        fn connect(&mut self) -> SdkCode {
            let code = self.record("connect");
            if code.is_success() {
                if let Some(listener) = &self.listener {
                    for event in self.feed.drain(..) {
                        let _ = listener.send(event);
                    }
                }
            }
            code
        }

        fn disconnect(&mut self) -> SdkCode {
            self.record("disconnect")
        }

        fn release(&mut self) -> SdkCode {
            self.record("release")
        }
    }

    struct FakeDevice;

    impl DeviceInfo for FakeDevice {
        fn device_id(&self) -> String {
            "dev-1".to_string()
        }

        fn battery_level(&self) -> i32 {
            90
        }
    }

    fn ctx() -> SessionContext {
        SessionContext {
            tenant_id: "tenant-1".to_string(),
            device_id: "dev-1".to_string(),
        }
    }

    fn position(lat_deg: f64, lon_deg: f64, solution: &str) -> SdkPosition {
        SdkPosition {
            latitude_rad: lat_deg * PI / 180.0,
            longitude_rad: lon_deg * PI / 180.0,
            solution: solution.to_string(),
            horizontal_precision: 0.8,
            vertical_precision: 1.2,
            pdop: 1.5,
            hdop: 0.9,
            vdop: 1.2,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SourceEvent>) -> SourceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for source event")
            .expect("event channel closed")
    }

    #[test]
    fn test_vendor_code_mapping() {
        let err = map_vendor_code(SdkStep::LoadCredentials, &SdkCode::named("ErrorNoLicense"));
        assert_eq!(err.code, Some(SourceErrorCode::NotLicensed));

        // Unrecognized load failures default to NO_SUBSCRIPTION
        let err = map_vendor_code(SdkStep::LoadCredentials, &SdkCode::named("Error"));
        assert_eq!(err.code, Some(SourceErrorCode::NoSubscription));

        let err = map_vendor_code(
            SdkStep::InitDriver,
            &SdkCode::named("DeviceTypeNotSupported"),
        );
        assert_eq!(err.code, Some(SourceErrorCode::ReceiverNotSupported));

        // Unrecognized init/connect failures default to RECEIVER_NOT_SUPPORTED
        let err = map_vendor_code(SdkStep::InitDriver, &SdkCode::named("ErrorDriverBusy"));
        assert_eq!(err.code, Some(SourceErrorCode::ReceiverNotSupported));

        let err = map_vendor_code(
            SdkStep::Connect,
            &SdkCode::named("ErrorInternetNotConnected"),
        );
        assert_eq!(err.code, Some(SourceErrorCode::ConnectionFailed));
    }

    #[tokio::test]
    async fn test_setup_stops_at_first_failed_step() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sdk = ScriptedSdk::failing(calls.clone(), "init_driver", "ErrorLoadingDriver");

        let mut source = SdkSource::new(
            SdkSourceConfig::default(),
            Arc::new(FakeDevice),
            Box::new(sdk),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        match next_event(&mut rx).await {
            SourceEvent::Error(err) => {
                assert_eq!(err.code, Some(SourceErrorCode::ReceiverNotSupported));
                assert!(err.message.contains("ErrorLoadingDriver"));
            }
            other => panic!("expected error, got {:?}", other),
        }

        source.close().await;

        let calls = calls.lock().unwrap().clone();
        // No listener registration or connect after the failed init; the
        // driver is still released, without a disconnect.
        assert_eq!(
            calls,
            vec!["load_credentials", "init_driver", "release"]
        );
    }

    #[tokio::test]
    async fn test_position_event_emits_sample_in_degrees() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sdk = ScriptedSdk::with_feed(
            calls.clone(),
            vec![
                SdkEvent::Power(SdkPower {
                    battery_level: 65,
                    charging: false,
                }),
                SdkEvent::Position(position(26.1, 91.8, "RTK_FIXED")),
            ],
        );

        let mut source = SdkSource::new(
            SdkSourceConfig::default(),
            Arc::new(FakeDevice),
            Box::new(sdk),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        match next_event(&mut rx).await {
            SourceEvent::Sample(sample) => {
                assert!((sample.latitude - 26.1).abs() < 1e-9);
                assert!((sample.longitude - 91.8).abs() < 1e-9);
                assert_eq!(sample.fix_type, "RTK_FIXED");
                // Power event arrived first and was cached, not emitted
                assert_eq!(sample.receiver_battery, Some(65));
                // Device battery stays local
                assert_eq!(sample.battery, 90);
                // No satellite event yet
                assert_eq!(sample.satellites, -1);
                assert_eq!(sample.health, "OK");
            }
            other => panic!("expected sample, got {:?}", other),
        }

        source.close().await;
    }

    #[tokio::test]
    async fn test_satellite_event_without_position_does_not_emit() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sdk = ScriptedSdk::with_feed(
            calls.clone(),
            vec![
                SdkEvent::Satellites { in_view: 9 },
                SdkEvent::Position(position(26.1, 91.8, "RTK_FIXED")),
                SdkEvent::Satellites { in_view: 11 },
            ],
        );

        let mut source = SdkSource::new(
            SdkSourceConfig::default(),
            Arc::new(FakeDevice),
            Box::new(sdk),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        // First emission comes from the position event, already carrying the
        // cached satellite count.
        match next_event(&mut rx).await {
            SourceEvent::Sample(sample) => assert_eq!(sample.satellites, 9),
            other => panic!("expected sample, got {:?}", other),
        }

        // Second satellite event recombines with the cached position.
        match next_event(&mut rx).await {
            SourceEvent::Sample(sample) => {
                assert_eq!(sample.satellites, 11);
                assert_eq!(sample.receiver_health, "EXCELLENT");
            }
            other => panic!("expected sample, got {:?}", other),
        }

        source.close().await;
    }

    #[tokio::test]
    async fn test_silent_driver_reports_connection_lost() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sdk = ScriptedSdk::new(calls.clone());

        let mut source = SdkSource::new(
            SdkSourceConfig {
                data_timeout: Duration::from_millis(50),
                ..SdkSourceConfig::default()
            },
            Arc::new(FakeDevice),
            Box::new(sdk),
        );

        let (tx, mut rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        match next_event(&mut rx).await {
            SourceEvent::Error(err) => {
                assert_eq!(err.code, Some(SourceErrorCode::ConnectionFailed));
            }
            other => panic!("expected error, got {:?}", other),
        }

        source.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sdk = ScriptedSdk::new(calls.clone());

        let mut source = SdkSource::new(
            SdkSourceConfig::default(),
            Arc::new(FakeDevice),
            Box::new(sdk),
        );

        let (tx, _rx) = mpsc::channel(16);
        source.connect(ctx(), tx).await;

        source.close().await;
        source.close().await;

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "load_credentials",
                "init_driver",
                "register_listener",
                "connect",
                "disconnect",
                "release"
            ]
        );
    }
}
