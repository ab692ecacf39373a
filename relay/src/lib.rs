//! GNSS telemetry relay core.
//!
//! Normalizes live receiver telemetry from a local source (the loopback
//! stream feed or a vendor positioning SDK) into one sample model, derives
//! health labels, and posts tenant-scoped telemetry to a remote endpoint
//! under a delivery cooldown, with heartbeat posting and offline detection.

pub mod controller;
pub mod delivery;
pub mod device;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod model;
pub mod observer;
pub mod rest;
pub mod sdk;
pub mod source;
pub mod stream;

pub use controller::{ControllerConfig, RelayController};
pub use delivery::{Delivery, DeliveryClient, DeliveryOutcome};
pub use device::{DeviceInfo, SystemDeviceInfo};
pub use errors::{Error, Result};
pub use health::HealthThresholds;
pub use model::{DiagnosticsEvent, SourceErrorCode, StatusEvent, TelemetrySample};
pub use observer::{Observer, RelayEvent};
pub use source::{ReceiverSource, SessionContext, SourceError, SourceEvent};
