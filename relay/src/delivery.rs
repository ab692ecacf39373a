//! Outbound telemetry delivery.
//!
//! One POST per call, no retry; retry policy belongs to the caller. The call
//! never fails past the returned outcome record.

use crate::errors::Result;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, DELIVERY_LATENCY_SECONDS};
use crate::model::TelemetrySample;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one delivery attempt. `timestamp` is endpoint-local wall time;
/// `message` is a payload summary on success and failure detail otherwise.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub timestamp: String,
    pub message: String,
    pub success: bool,
}

/// Delivery capability, the seam between the controller and the transport.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn send(&self, sample: &TelemetrySample) -> DeliveryOutcome;
}

pub struct DeliveryClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl DeliveryClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }
}

#[async_trait]
impl Delivery for DeliveryClient {
    async fn send(&self, sample: &TelemetrySample) -> DeliveryOutcome {
        let body = TelemetryBody::from_sample(sample, Utc::now());

        debug!("Sending telemetry POST to {}", self.endpoint);

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();

                if status.is_success() {
                    DeliveryOutcome {
                        timestamp: endpoint_local_hms(Utc::now()),
                        message: format!(
                            "Lat:{}, Lng:{}, Bat:{}%",
                            sample.latitude, sample.longitude, sample.battery
                        ),
                        success: true,
                    }
                } else {
                    warn!("Telemetry POST rejected with {}: {}", status.as_u16(), text);
                    DeliveryOutcome {
                        timestamp: endpoint_local_hms(Utc::now()),
                        message: format!("Error {}: {}", status.as_u16(), text),
                        success: false,
                    }
                }
            }
            Err(e) => {
                warn!("Telemetry POST failed: {}", e);
                DeliveryOutcome {
                    timestamp: endpoint_local_hms(Utc::now()),
                    message: format!("Failed: {}", e),
                    success: false,
                }
            }
        };

        DELIVERY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        DELIVERIES_TOTAL.inc();
        if !outcome.success {
            DELIVERY_FAILURES_TOTAL.inc();
        }

        outcome
    }
}

/// The endpoint runs on UTC+5:30 local time.
fn endpoint_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
}

fn endpoint_local_hms(now: DateTime<Utc>) -> String {
    now.with_timezone(&endpoint_offset())
        .format("%H:%M:%S")
        .to_string()
}

/// Wire body. Field names and casing are a contract with the endpoint;
/// optional fields are omitted entirely when absent.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TelemetryBody<'a> {
    tenant_id: &'a str,
    device_id: &'a str,
    latitude: f64,
    longitude: f64,
    battery: i32,
    fix_type: &'a str,
    /// Sample production time, UTC.
    timestamp: String,
    /// Endpoint-local send time, distinct from the sample timestamp.
    current_timestamp: String,
    health: &'a str,
    horizontal_accuracy: f64,
    vertical_accuracy: f64,
    satellites: i32,
    receiver_health: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver_battery: Option<i32>,
    #[serde(rename = "PDOP", skip_serializing_if = "Option::is_none")]
    pdop: Option<f64>,
    #[serde(rename = "HDOP", skip_serializing_if = "Option::is_none")]
    hdop: Option<f64>,
    #[serde(rename = "VDOP", skip_serializing_if = "Option::is_none")]
    vdop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_email: Option<&'a str>,
}

impl<'a> TelemetryBody<'a> {
    fn from_sample(sample: &'a TelemetrySample, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: &sample.tenant_id,
            device_id: &sample.device_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            battery: sample.battery,
            fix_type: &sample.fix_type,
            timestamp: sample.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            current_timestamp: now
                .with_timezone(&endpoint_offset())
                .format("%Y-%m-%dT%H:%M:%S%:z")
                .to_string(),
            health: &sample.health,
            horizontal_accuracy: sample.horizontal_accuracy,
            vertical_accuracy: sample.vertical_accuracy,
            satellites: sample.satellites,
            receiver_health: &sample.receiver_health,
            receiver_battery: sample.receiver_battery,
            pdop: sample.pdop,
            hdop: sample.hdop,
            vdop: sample.vdop,
            user_id: sample.user_id.as_deref(),
            user_name: sample.user_name.as_deref(),
            user_email: sample.user_email.as_deref(),
        }
    }
}
