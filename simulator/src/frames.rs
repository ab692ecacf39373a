use chrono::Utc;
use rand::Rng;
use serde::Serialize;

/// One positional feed frame, shaped like the receiver-management process
/// emits them. Optional fields are omitted when the walk decides the
/// receiver "did not report" them this time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub latitude: f64,
    pub longitude: f64,
    pub fix_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellites: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pdop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vdop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_battery: Option<i32>,
    pub timestamp: String,
}

/// Random-walk GNSS receiver.
pub struct Receiver {
    latitude: f64,
    longitude: f64,
    fix_index: usize,
    battery: i32,
}

const FIX_TYPES: [&str; 4] = ["NO_FIX", "AUTONOMOUS", "RTK_FLOAT", "RTK_FIXED"];

impl Receiver {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            fix_index: 1,
            battery: 95,
        }
    }

    /// Next frame of the walk. Roughly 5% of frames are non-positional
    /// receiver chatter the relay must ignore.
    pub fn next_frame(&mut self, rng: &mut impl Rng) -> String {
        if rng.gen_bool(0.05) {
            return serde_json::json!({
                "type": "status",
                "message": "receiver heartbeat",
            })
            .to_string();
        }

        self.step(rng);

        let fix_type = FIX_TYPES[self.fix_index];
        let has_fix = fix_type != "NO_FIX";

        let horizontal_accuracy = match fix_type {
            "RTK_FIXED" => rng.gen_range(0.01..0.9),
            "RTK_FLOAT" => rng.gen_range(0.3..2.0),
            "AUTONOMOUS" => rng.gen_range(1.5..6.0),
            _ => rng.gen_range(10.0..50.0),
        };

        let frame = Frame {
            latitude: if has_fix { self.latitude } else { 0.0 },
            longitude: if has_fix { self.longitude } else { 0.0 },
            fix_type: fix_type.to_string(),
            // Receivers occasionally drop accuracy/DOP figures
            horizontal_accuracy: keep(rng, 0.9, horizontal_accuracy),
            vertical_accuracy: keep(rng, 0.9, horizontal_accuracy * 1.6),
            satellites: {
                let v = self.satellites(rng, fix_type);
                keep(rng, 0.95, v)
            },
            hdop: {
                let v = rng.gen_range(0.6..2.8);
                keep(rng, 0.8, v)
            },
            pdop: {
                let v = rng.gen_range(1.0..4.0);
                keep(rng, 0.8, v)
            },
            vdop: {
                let v = rng.gen_range(0.8..3.2);
                keep(rng, 0.8, v)
            },
            receiver_battery: keep(rng, 0.7, self.battery),
            timestamp: Utc::now().to_rfc3339(),
        };

        serde_json::to_string(&frame).unwrap_or_default()
    }

    fn step(&mut self, rng: &mut impl Rng) {
        // ~1m jitter per step
        self.latitude += rng.gen_range(-0.00001..0.00001);
        self.longitude += rng.gen_range(-0.00001..0.00001);

        // Fix quality drifts one level at a time
        if rng.gen_bool(0.1) {
            if rng.gen_bool(0.6) {
                self.fix_index = (self.fix_index + 1).min(FIX_TYPES.len() - 1);
            } else {
                self.fix_index = self.fix_index.saturating_sub(1);
            }
        }

        if rng.gen_bool(0.01) {
            self.battery = (self.battery - 1).max(0);
        }
    }

    fn satellites(&self, rng: &mut impl Rng, fix_type: &str) -> i32 {
        match fix_type {
            "NO_FIX" => rng.gen_range(0..4),
            "AUTONOMOUS" => rng.gen_range(3..8),
            _ => rng.gen_range(8..24),
        }
    }
}

fn keep<T>(rng: &mut impl Rng, probability: f64, value: T) -> Option<T> {
    rng.gen_bool(probability).then_some(value)
}
