use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized GNSS + device reading produced by a receiver source.
///
/// Coordinates are degrees; (0, 0) is the "no fix yet" sentinel, never a real
/// position. Accuracy fields use -1.0 for "not reported", satellite count uses
/// -1 for "unknown".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub tenant_id: String,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Local device battery percent (0-100), always present.
    pub battery: i32,
    pub fix_type: String,
    pub timestamp: DateTime<Utc>,
    pub health: String,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    pub satellites: i32,
    pub receiver_health: String,
    /// External receiver battery percent, absent when the source does not
    /// report one.
    pub receiver_battery: Option<i32>,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
}

impl TelemetrySample {
    /// True when the sample carries a usable position. Only positional
    /// samples may update the last-known-location cache.
    pub fn has_position(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }
}

/// Structured error codes a receiver source can surface. Fatal to the
/// current session; recovery requires an external stop/start cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceErrorCode {
    NoSubscription,
    NotLicensed,
    NoBluetoothPermission,
    ReceiverNotSupported,
    ConnectionFailed,
}

impl SourceErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceErrorCode::NoSubscription => "NO_SUBSCRIPTION",
            SourceErrorCode::NotLicensed => "NOT_LICENSED",
            SourceErrorCode::NoBluetoothPermission => "NO_BLUETOOTH_PERMISSION",
            SourceErrorCode::ReceiverNotSupported => "RECEIVER_NOT_SUPPORTED",
            SourceErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

impl fmt::Display for SourceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status event published to external observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: String,
    pub post_timestamp: String,
    pub post_payload: String,
}

impl Default for StatusEvent {
    fn default() -> Self {
        Self {
            status: "Stopped".to_string(),
            post_timestamp: String::new(),
            post_payload: String::new(),
        }
    }
}

/// Diagnostics event published to external observers on every sample.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsEvent {
    pub location_permission: bool,
    pub bluetooth_permission: bool,
    pub fix_type: String,
    pub satellites: i32,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    pub receiver_health: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_battery: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_position() {
        let mut sample = sample_at(26.1445, 91.7362);
        assert!(sample.has_position());

        sample.latitude = 0.0;
        sample.longitude = 0.0;
        assert!(!sample.has_position());

        // A single non-zero axis still counts as a position
        sample.longitude = 91.7362;
        assert!(sample.has_position());
    }

    #[test]
    fn test_source_error_code_labels() {
        assert_eq!(SourceErrorCode::NoSubscription.as_str(), "NO_SUBSCRIPTION");
        assert_eq!(
            SourceErrorCode::NoBluetoothPermission.to_string(),
            "NO_BLUETOOTH_PERMISSION"
        );
        let json = serde_json::to_string(&SourceErrorCode::ConnectionFailed).unwrap();
        assert_eq!(json, "\"CONNECTION_FAILED\"");
    }

    #[test]
    fn test_diagnostics_event_camel_case() {
        let event = DiagnosticsEvent {
            location_permission: true,
            bluetooth_permission: false,
            fix_type: "RTK_FIXED".to_string(),
            satellites: 12,
            horizontal_accuracy: 0.8,
            vertical_accuracy: 1.2,
            receiver_health: "EXCELLENT".to_string(),
            receiver_battery: None,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["locationPermission"], true);
        assert_eq!(value["fixType"], "RTK_FIXED");
        assert!(value.get("receiverBattery").is_none());
    }

    fn sample_at(latitude: f64, longitude: f64) -> TelemetrySample {
        TelemetrySample {
            tenant_id: "tenant-1".to_string(),
            device_id: "dev-1".to_string(),
            latitude,
            longitude,
            battery: 80,
            fix_type: "RTK_FIXED".to_string(),
            timestamp: Utc::now(),
            health: "OK".to_string(),
            horizontal_accuracy: 0.9,
            vertical_accuracy: 1.4,
            satellites: 10,
            receiver_health: "EXCELLENT".to_string(),
            receiver_battery: Some(75),
            pdop: Some(1.6),
            hdop: Some(0.8),
            vdop: Some(1.1),
            user_id: None,
            user_name: None,
            user_email: None,
        }
    }
}
