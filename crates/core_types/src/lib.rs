use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a perception input. The category decides which direction the
/// override comparison runs in, so the threshold semantics stay an explicit
/// per-variant policy instead of scattered branching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    /// Nearest-detected-person streams. Depth grows as the subject closes in,
    /// so an override fires once the measurement reaches the threshold.
    Proximity,
    /// Pointed-at-target streams. An override fires once the pointed depth
    /// drops to the threshold, i.e. the target is close enough.
    PointedTarget,
}

impl SourceCategory {
    /// Whether a fresh measurement crossing the configured threshold should
    /// seize control outright.
    pub fn override_fires(self, measurement: f64, threshold: f64) -> bool {
        match self {
            Self::Proximity => measurement >= threshold,
            Self::PointedTarget => measurement <= threshold,
        }
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Proximity => "proximity",
            Self::PointedTarget => "pointed_target",
        };
        f.write_str(value)
    }
}

/// Whether a mapped target is an absolute actuator pose or an offset from the
/// current pose. Carried through to the driver untouched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GazeMode {
    Absolute,
    Relative,
}

/// One mapped gaze command, produced by an input source and consumed by the
/// gaze controller of whichever source currently holds the actuator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GazeTarget {
    pub pan_deg: f64,
    pub tilt_deg: f64,
    pub mode: GazeMode,
    pub ts_ms: i64,
}

/// Single observed person in a perception frame. Coordinates are sensor
/// pixels; `z` is the depth estimate used for proximity overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonObs {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeopleFrame {
    pub ts_ms: i64,
    pub people: Vec<PersonObs>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointFrame {
    pub ts_ms: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Wire format for perception datagrams received by `feed_udp`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerceptionFrame {
    People(PeopleFrame),
    Point(PointFrame),
}

/// Fatal startup problems. Anything recoverable at runtime is handled as a
/// silent data gap instead, see the arbitration crate.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("source/actuator list length mismatch: {sources} sources vs {actuators} actuators")]
    LengthMismatch { sources: usize, actuators: usize },
    #[error("override mode enabled but {got} thresholds were provided for {want} sources")]
    ThresholdCount { want: usize, got: usize },
    #[error("source {0}: resolution and fov must be positive")]
    BadGeometry(String),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Downstream actuator seam. The shipped impls log or forward over UDP; a
/// real robot driver plugs in here.
pub trait GazeDriver: Send + Sync {
    fn drive(&self, source: &str, target: &GazeTarget);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proximity_override_fires_on_near_enough() {
        assert!(SourceCategory::Proximity.override_fires(50.0, 40.0));
        assert!(SourceCategory::Proximity.override_fires(40.0, 40.0));
        assert!(!SourceCategory::Proximity.override_fires(39.9, 40.0));
    }

    #[test]
    fn pointed_target_override_fires_on_close_enough() {
        assert!(SourceCategory::PointedTarget.override_fires(0.3, 0.5));
        assert!(SourceCategory::PointedTarget.override_fires(0.5, 0.5));
        assert!(!SourceCategory::PointedTarget.override_fires(0.6, 0.5));
    }

    #[test]
    fn perception_frame_roundtrip() {
        let frame = PerceptionFrame::People(PeopleFrame {
            ts_ms: 1_700_000_000_000,
            people: vec![PersonObs {
                x: 320.0,
                y: 240.0,
                z: 42.0,
            }],
        });
        let raw = serde_json::to_string(&frame).expect("serialize");
        assert!(raw.contains("\"kind\":\"people\""));
        let parsed: PerceptionFrame = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, frame);
    }
}
