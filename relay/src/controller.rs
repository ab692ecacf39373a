//! Relay session controller.
//!
//! Owns one active receiver source and drives the whole session from a single
//! event loop: source events, delivery outcomes and the three periodic timers
//! all land here, so every mutation of session state is serialized without a
//! lock. Deliveries run as spawned tasks and report back over a channel; an
//! outcome that arrives after the session stopped is dropped with the channel.

use crate::delivery::{Delivery, DeliveryOutcome};
use crate::device::DeviceInfo;
use crate::health::HealthThresholds;
use crate::metrics::{OFFLINE_EMISSIONS_TOTAL, SAMPLES_TOTAL, SOURCE_ERRORS_TOTAL};
use crate::model::{DiagnosticsEvent, SourceErrorCode, StatusEvent, TelemetrySample};
use crate::observer::Observer;
use crate::source::{ReceiverSource, SessionContext, SourceError, SourceEvent};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Policy windows for a relay session. The literal defaults mirror the
/// receiver vendor's deployment guidance; every window is tunable.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub tenant_id: String,
    /// Minimum gap after a successful delivery before the next attempt.
    pub delivery_cooldown: Duration,
    /// Quiet period after which the session counts as offline.
    pub offline_after: Duration,
    pub offline_check_interval: Duration,
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
    pub thresholds: HealthThresholds,
}

impl ControllerConfig {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            delivery_cooldown: Duration::from_secs(5 * 60),
            offline_after: Duration::from_secs(10 * 60),
            offline_check_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5 * 60),
            status_interval: Duration::from_secs(30),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// Mutable session state, touched only from the event loop.
struct SessionState {
    last_message_at: Instant,
    last_known_latitude: f64,
    last_known_longitude: f64,
    last_known_fix_type: String,
    last_successful_delivery_at: Option<Instant>,
    last_post_timestamp: String,
    last_post_payload: String,
    current_source_error: Option<SourceErrorCode>,
    running: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            last_message_at: Instant::now(),
            last_known_latitude: 0.0,
            last_known_longitude: 0.0,
            last_known_fix_type: "UNKNOWN".to_string(),
            last_successful_delivery_at: None,
            last_post_timestamp: String::new(),
            last_post_payload: String::new(),
            current_source_error: None,
            running: false,
        }
    }

    fn has_last_known_position(&self) -> bool {
        self.last_known_latitude != 0.0 || self.last_known_longitude != 0.0
    }
}

pub struct RelayController {
    config: ControllerConfig,
    device: Arc<dyn DeviceInfo>,
    delivery: Arc<dyn Delivery>,
    observer: Arc<Observer>,
}

impl RelayController {
    pub fn new(
        config: ControllerConfig,
        device: Arc<dyn DeviceInfo>,
        delivery: Arc<dyn Delivery>,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            config,
            device,
            delivery,
            observer,
        }
    }

    /// Run one relay session until `shutdown` yields. Consumes the
    /// controller; a new session means a new controller and a new source.
    pub async fn run(self, mut source: Box<dyn ReceiverSource>, mut shutdown: mpsc::Receiver<()>) {
        let ctx = SessionContext {
            tenant_id: self.config.tenant_id.clone(),
            device_id: self.device.device_id(),
        };

        info!(
            "Starting relay session for tenant {} on device {} via {} source",
            ctx.tenant_id,
            ctx.device_id,
            source.name()
        );

        let (source_tx, mut source_rx) = mpsc::channel(1024);
        source.connect(ctx.clone(), source_tx).await;

        let mut state = SessionState::new();
        state.running = true;

        // Initial diagnostics so observers have something to render before
        // the first real sample.
        let initial = self.synthesize(&ctx, 0.0, 0.0, "UNKNOWN", "OK");
        self.observer
            .publish_diagnostics(self.diagnostics_for(&initial))
            .await;
        self.publish_status(&state).await;

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<DeliveryOutcome>(64);

        // First fire after one full period, not at start.
        let mut offline_tick = delayed_interval(self.config.offline_check_interval);
        let mut heartbeat_tick = delayed_interval(self.config.heartbeat_interval);
        let mut status_tick = delayed_interval(self.config.status_interval);

        let mut source_done = false;

        loop {
            tokio::select! {
                event = source_rx.recv(), if !source_done => match event {
                    Some(SourceEvent::Sample(sample)) => {
                        self.on_sample(&mut state, sample, &outcome_tx).await;
                    }
                    Some(SourceEvent::Error(error)) => {
                        self.on_source_error(&mut state, error).await;
                    }
                    None => {
                        // Source task gone; the session stays up (timers keep
                        // running) until an external stop/start cycle.
                        debug!("Source event channel closed");
                        source_done = true;
                    }
                },
                Some(outcome) = outcome_rx.recv() => {
                    self.on_outcome(&mut state, outcome).await;
                }
                _ = offline_tick.tick() => {
                    self.on_offline_tick(&mut state, &ctx).await;
                }
                _ = heartbeat_tick.tick() => {
                    self.on_heartbeat_tick(&mut state, &ctx, &outcome_tx).await;
                }
                _ = status_tick.tick() => {
                    self.publish_status(&state).await;
                }
                _ = shutdown.recv() => {
                    info!("Relay session stop requested");
                    break;
                }
            }
        }

        state.running = false;
        source.close().await;
        self.publish_status(&state).await;
        info!("Relay session stopped");
    }

    async fn on_sample(
        &self,
        state: &mut SessionState,
        sample: TelemetrySample,
        outcome_tx: &mpsc::Sender<DeliveryOutcome>,
    ) {
        SAMPLES_TOTAL.inc();
        state.last_message_at = Instant::now();
        state.current_source_error = None;

        if sample.has_position() {
            state.last_known_latitude = sample.latitude;
            state.last_known_longitude = sample.longitude;
            state.last_known_fix_type = sample.fix_type.clone();
        }

        self.observer
            .publish_diagnostics(self.diagnostics_for(&sample))
            .await;

        self.maybe_deliver(state, sample, outcome_tx);
    }

    /// Apply the cooldown policy, then hand the sample to a delivery task.
    /// Bounds outbound call volume regardless of the upstream sample rate.
    fn maybe_deliver(
        &self,
        state: &SessionState,
        sample: TelemetrySample,
        outcome_tx: &mpsc::Sender<DeliveryOutcome>,
    ) {
        let due = match state.last_successful_delivery_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.delivery_cooldown,
        };

        if !due {
            debug!("Delivery cooldown active, skipping post");
            return;
        }

        let delivery = self.delivery.clone();
        let outcome_tx = outcome_tx.clone();
        tokio::spawn(async move {
            let outcome = delivery.send(&sample).await;
            // The session may have stopped while the POST was in flight.
            let _ = outcome_tx.send(outcome).await;
        });
    }

    async fn on_outcome(&self, state: &mut SessionState, outcome: DeliveryOutcome) {
        if outcome.success {
            state.last_successful_delivery_at = Some(Instant::now());
        }
        state.last_post_timestamp = outcome.timestamp;
        state.last_post_payload = outcome.message;

        self.publish_status(state).await;
    }

    async fn on_source_error(&self, state: &mut SessionState, error: SourceError) {
        SOURCE_ERRORS_TOTAL.inc();
        error!("Source error: {}", error);
        state.current_source_error = error.code;

        // Surface the structured code when there is one, the raw message
        // otherwise. The next successful sample clears the indicator.
        let status = match error.code {
            Some(code) => code.as_str().to_string(),
            None => error.message,
        };

        self.observer
            .publish_status(StatusEvent {
                status,
                post_timestamp: state.last_post_timestamp.clone(),
                post_payload: state.last_post_payload.clone(),
            })
            .await;
    }

    async fn on_offline_tick(&self, state: &mut SessionState, ctx: &SessionContext) {
        if state.last_message_at.elapsed() < self.config.offline_after {
            return;
        }

        OFFLINE_EMISSIONS_TOTAL.inc();
        warn!(
            "No data from source for {:?}, emitting offline diagnostics",
            self.config.offline_after
        );

        let sample = self.synthesize(ctx, 0.0, 0.0, "UNKNOWN", "OFFLINE");
        self.observer
            .publish_diagnostics(self.diagnostics_for(&sample))
            .await;
    }

    async fn on_heartbeat_tick(
        &self,
        state: &mut SessionState,
        ctx: &SessionContext,
        outcome_tx: &mpsc::Sender<DeliveryOutcome>,
    ) {
        if !state.has_last_known_position() {
            return;
        }

        debug!("Heartbeat post from last known position");
        let sample = self.synthesize(
            ctx,
            state.last_known_latitude,
            state.last_known_longitude,
            &state.last_known_fix_type,
            "OK",
        );
        self.maybe_deliver(state, sample, outcome_tx);
    }

    fn status_string(&self, state: &SessionState) -> &'static str {
        if !state.running {
            "Stopped"
        } else if state.last_successful_delivery_at.is_none() {
            "Started"
        } else {
            "Waiting for data"
        }
    }

    async fn publish_status(&self, state: &SessionState) {
        self.observer
            .publish_status(StatusEvent {
                status: self.status_string(state).to_string(),
                post_timestamp: state.last_post_timestamp.clone(),
                post_payload: state.last_post_payload.clone(),
            })
            .await;
    }

    fn diagnostics_for(&self, sample: &TelemetrySample) -> DiagnosticsEvent {
        DiagnosticsEvent {
            location_permission: self.device.location_permission(),
            bluetooth_permission: self.device.bluetooth_permission(),
            fix_type: sample.fix_type.clone(),
            satellites: sample.satellites,
            horizontal_accuracy: sample.horizontal_accuracy,
            vertical_accuracy: sample.vertical_accuracy,
            receiver_health: sample.receiver_health.clone(),
            receiver_battery: sample.receiver_battery,
        }
    }

    /// Synthesized sample for heartbeat/offline/initial paths; carries the
    /// sentinel accuracy and satellite values.
    fn synthesize(
        &self,
        ctx: &SessionContext,
        latitude: f64,
        longitude: f64,
        fix_type: &str,
        health: &str,
    ) -> TelemetrySample {
        TelemetrySample {
            tenant_id: ctx.tenant_id.clone(),
            device_id: ctx.device_id.clone(),
            latitude,
            longitude,
            battery: self.device.battery_level(),
            fix_type: fix_type.to_string(),
            timestamp: Utc::now(),
            health: health.to_string(),
            horizontal_accuracy: -1.0,
            vertical_accuracy: -1.0,
            satellites: -1,
            receiver_health: "UNKNOWN".to_string(),
            receiver_battery: None,
            pdop: None,
            hdop: None,
            vdop: None,
            user_id: None,
            user_name: None,
            user_email: None,
        }
    }
}

/// Interval whose first tick lands one full period from now.
fn delayed_interval(period: Duration) -> tokio::time::Interval {
    interval_at(Instant::now() + period, period)
}
