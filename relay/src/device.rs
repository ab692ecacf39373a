//! Local device identity and state, injected as a capability object so the
//! controller and sources never reach for process-wide singletons.

use std::fs;
use std::path::Path;
use tracing::debug;

/// Capability view of the host device.
pub trait DeviceInfo: Send + Sync {
    /// Stable per-installation identifier.
    fn device_id(&self) -> String;

    /// Local device battery percent (0-100).
    fn battery_level(&self) -> i32;

    fn location_permission(&self) -> bool {
        true
    }

    fn bluetooth_permission(&self) -> bool {
        true
    }
}

/// DeviceInfo backed by the host system: machine id for identity, the kernel
/// power-supply class for battery, with configured fallbacks for hosts that
/// expose neither.
#[derive(Debug, Clone)]
pub struct SystemDeviceInfo {
    id: String,
    fallback_battery: i32,
}

impl SystemDeviceInfo {
    pub fn new(id_override: Option<String>, fallback_battery: i32) -> Self {
        let id = id_override
            .filter(|id| !id.is_empty())
            .or_else(machine_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            id,
            fallback_battery: fallback_battery.clamp(0, 100),
        }
    }
}

impl DeviceInfo for SystemDeviceInfo {
    fn device_id(&self) -> String {
        self.id.clone()
    }

    fn battery_level(&self) -> i32 {
        sysfs_battery().unwrap_or(self.fallback_battery)
    }
}

fn machine_id() -> Option<String> {
    let id = fs::read_to_string("/etc/machine-id").ok()?;
    let id = id.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// First readable `capacity` under /sys/class/power_supply.
fn sysfs_battery() -> Option<i32> {
    let entries = fs::read_dir(Path::new("/sys/class/power_supply")).ok()?;

    for entry in entries.flatten() {
        let capacity = entry.path().join("capacity");
        if let Ok(text) = fs::read_to_string(&capacity) {
            if let Ok(level) = text.trim().parse::<i32>() {
                debug!("Battery level {}% from {:?}", level, capacity);
                return Some(level.clamp(0, 100));
            }
        }
    }

    None
}
