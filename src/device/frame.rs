// Sensor Frame
// One telemetry sample from the vehicle device and its line parser

use crate::bus::now_millis;
use serde::{Deserialize, Serialize};

/// Impact force above which a frame counts as a crash
pub const IMPACT_THRESHOLD: f32 = 5.0;

/// Parsed telemetry sample
///
/// Wire form: `ACC:x,y,z|IMPACT:f|GPS:lat,lon`, every segment optional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    pub acc_x: f32,
    pub acc_y: f32,
    pub acc_z: f32,
    pub impact_force: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Epoch millis at which the frame was parsed
    pub captured_at: u64,
}

impl Default for SensorFrame {
    fn default() -> Self {
        Self {
            acc_x: 0.0,
            acc_y: 0.0,
            acc_z: 0.0,
            impact_force: 0.0,
            latitude: None,
            longitude: None,
            captured_at: 0,
        }
    }
}

impl SensorFrame {
    /// Parse a telemetry line. Never fails: missing segments keep their
    /// defaults, bad numbers read as 0, bad coordinates as absent.
    pub fn parse(line: &str) -> Self {
        Self::parse_at(line, now_millis())
    }

    pub fn parse_at(line: &str, captured_at: u64) -> Self {
        let mut frame = Self {
            captured_at,
            ..Self::default()
        };

        for segment in line.trim().split('|') {
            let segment = segment.trim();
            if let Some(rest) = segment.strip_prefix("ACC:") {
                let values: Vec<&str> = rest.split(',').collect();
                if values.len() >= 3 {
                    frame.acc_x = number(values[0]);
                    frame.acc_y = number(values[1]);
                    frame.acc_z = number(values[2]);
                }
            } else if let Some(rest) = segment.strip_prefix("IMPACT:") {
                frame.impact_force = number(rest);
            } else if let Some(rest) = segment.strip_prefix("GPS:") {
                let values: Vec<&str> = rest.split(',').collect();
                if values.len() >= 2 {
                    frame.latitude = coordinate(values[0]);
                    frame.longitude = coordinate(values[1]);
                }
            }
        }

        frame
    }

    /// Whether the impact force exceeds `IMPACT_THRESHOLD`
    pub fn is_impact(&self) -> bool {
        self.exceeds(IMPACT_THRESHOLD)
    }

    pub fn exceeds(&self, threshold: f32) -> bool {
        self.impact_force > threshold
    }

    pub fn has_gps(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    pub fn gps(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }

    /// Short human-readable description
    pub fn summary(&self) -> String {
        format!(
            "Acc: ({:.1}, {:.1}, {:.1}) Impact: {:.1}g",
            self.acc_x, self.acc_y, self.acc_z, self.impact_force
        )
    }
}

fn number(token: &str) -> f32 {
    match token.trim().parse::<f32>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

fn coordinate(token: &str) -> Option<f64> {
    token.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
