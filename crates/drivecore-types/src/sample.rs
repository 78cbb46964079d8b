//! Raw and normalized sensor samples.
//!
//! A [`SensorSample`] is what the acquisition layer hands to the core: raw
//! units, modality-specific payload, a capture timestamp and a quality score.
//! The normalizer turns it into a [`NormalizedSample`] whose payload is in SI
//! units (metres, metres/second, radians).

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::obstacle::ObstacleType;
use crate::VehicleId;

// ────────────────────────────────────────────────────────────────────────────
// Modality
// ────────────────────────────────────────────────────────────────────────────

/// Sensor modality feeding the fusion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Lidar,
    Radar,
    Vision,
    Gps,
    Imu,
}

impl Modality {
    /// Every modality, in index order.
    pub const ALL: [Modality; 5] = [
        Modality::Lidar,
        Modality::Radar,
        Modality::Vision,
        Modality::Gps,
        Modality::Imu,
    ];

    /// Number of modalities; the size of per-modality arrays.
    pub const COUNT: usize = 5;

    /// Stable array index for per-modality tables.
    pub const fn index(self) -> usize {
        match self {
            Modality::Lidar => 0,
            Modality::Radar => 1,
            Modality::Vision => 2,
            Modality::Gps => 3,
            Modality::Imu => 4,
        }
    }

    /// `true` for modalities that report obstacle detections.
    pub const fn detects_objects(self) -> bool {
        matches!(self, Modality::Lidar | Modality::Radar | Modality::Vision)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Modality::Lidar => "lidar",
            Modality::Radar => "radar",
            Modality::Vision => "vision",
            Modality::Gps => "gps",
            Modality::Imu => "imu",
        };
        f.write_str(name)
    }
}

/// A compact set of modalities (one bit per [`Modality`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ModalitySet(u8);

impl ModalitySet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add `modality` to the set.
    pub fn insert(&mut self, modality: Modality) {
        self.0 |= 1 << modality.index();
    }

    /// Remove `modality` from the set.
    pub fn remove(&mut self, modality: Modality) {
        self.0 &= !(1 << modality.index());
    }

    pub fn contains(&self, modality: Modality) -> bool {
        self.0 & (1 << modality.index()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the members in index order.
    pub fn iter(&self) -> impl Iterator<Item = Modality> + '_ {
        Modality::ALL.into_iter().filter(|m| self.contains(*m))
    }
}

impl FromIterator<Modality> for ModalitySet {
    fn from_iter<I: IntoIterator<Item = Modality>>(iter: I) -> Self {
        let mut set = ModalitySet::empty();
        for m in iter {
            set.insert(m);
        }
        set
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Units
// ────────────────────────────────────────────────────────────────────────────

/// A length in whatever unit the sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Length {
    Meters(f64),
    Centimeters(f64),
    Feet(f64),
    Yards(f64),
}

impl Length {
    pub fn to_meters(self) -> f64 {
        match self {
            Length::Meters(v) => v,
            Length::Centimeters(v) => v / 100.0,
            Length::Feet(v) => v * 0.3048,
            Length::Yards(v) => v * 0.9144,
        }
    }
}

/// A speed in whatever unit the sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Speed {
    MetersPerSecond(f64),
    KilometersPerHour(f64),
    MilesPerHour(f64),
    Knots(f64),
}

impl Speed {
    pub fn to_mps(self) -> f64 {
        match self {
            Speed::MetersPerSecond(v) => v,
            Speed::KilometersPerHour(v) => v / 3.6,
            Speed::MilesPerHour(v) => v * 0.44704,
            Speed::Knots(v) => v * 0.514_444,
        }
    }
}

/// An angle in whatever unit the sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "unit", content = "value", rename_all = "snake_case")]
pub enum Angle {
    Radians(f64),
    Degrees(f64),
}

impl Angle {
    pub fn to_radians(self) -> f64 {
        match self {
            Angle::Radians(v) => v,
            Angle::Degrees(v) => v.to_radians(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Raw samples
// ────────────────────────────────────────────────────────────────────────────

/// One object reported by a detecting sensor (or by the opaque vision model).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawDetection {
    pub obstacle_type: ObstacleType,
    /// Range from the sensor origin.
    pub range: Length,
    /// Bearing, counter-clockwise positive, zero straight ahead.
    pub bearing: Angle,
    /// Closing speed; positive when the gap is shrinking.
    pub closing_speed: Speed,
    pub width: Length,
    /// Detector confidence for this object (0–1).
    pub confidence: f64,
}

/// Modality-specific measurement carried by a [`SensorSample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorPayload {
    /// Object detections from Lidar, Radar or Vision.
    Detections { detections: Vec<RawDetection> },
    /// A satellite position fix.
    Fix {
        latitude_deg: f64,
        longitude_deg: f64,
        heading: Angle,
        speed: Speed,
    },
    /// Inertial measurement.
    Inertial {
        longitudinal_accel_mps2: f64,
        lateral_accel_mps2: f64,
        /// Yaw rate, expressed per second.
        yaw_rate: Angle,
    },
}

/// A single raw sample from the acquisition layer.
///
/// Immutable once created and consumed exactly once by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensorSample {
    pub vehicle_id: VehicleId,
    pub modality: Modality,
    pub capture_time: DateTime<Utc>,
    pub payload: SensorPayload,
    /// Intrinsic data quality reported by the sensor (0–1).
    pub quality: f64,
}

// ────────────────────────────────────────────────────────────────────────────
// Normalized samples
// ────────────────────────────────────────────────────────────────────────────

/// A detection in SI units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Detection {
    pub obstacle_type: ObstacleType,
    pub distance_m: f64,
    pub bearing_rad: f64,
    pub closing_speed_mps: f64,
    pub width_m: f64,
    pub confidence: f64,
}

/// SI-unit payload of a [`NormalizedSample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedPayload {
    Detections {
        detections: Vec<Detection>,
    },
    /// Fix projected into the local east/north frame anchored at the first
    /// accepted fix of the stream.
    Pose {
        east_m: f64,
        north_m: f64,
        /// Counter-clockwise from east.
        heading_rad: f64,
        speed_mps: f64,
    },
    Inertial {
        longitudinal_accel_mps2: f64,
        lateral_accel_mps2: f64,
        yaw_rate_rps: f64,
    },
}

/// A validated sample with a per-modality sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedSample {
    pub modality: Modality,
    /// Strictly increasing within one modality stream, starting at 1.
    pub sequence_id: u64,
    pub capture_time: DateTime<Utc>,
    pub quality: f64,
    pub payload: NormalizedPayload,
}

impl NormalizedSample {
    /// Detections carried by this sample (empty for ego-state modalities).
    pub fn detections(&self) -> &[Detection] {
        match &self.payload {
            NormalizedPayload::Detections { detections } => detections,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversions() {
        assert!((Length::Feet(10.0).to_meters() - 3.048).abs() < 1e-9);
        assert!((Length::Centimeters(250.0).to_meters() - 2.5).abs() < 1e-9);
        assert!((Speed::KilometersPerHour(36.0).to_mps() - 10.0).abs() < 1e-9);
        assert!((Speed::MilesPerHour(10.0).to_mps() - 4.4704).abs() < 1e-9);
        assert!((Angle::Degrees(180.0).to_radians() - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn modality_set_membership() {
        let mut set: ModalitySet = [Modality::Lidar, Modality::Radar].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Modality::Radar));
        assert!(!set.contains(Modality::Vision));
        set.remove(Modality::Lidar);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Modality::Radar]);
    }

    #[test]
    fn modality_indices_are_dense() {
        for (i, m) in Modality::ALL.iter().enumerate() {
            assert_eq!(m.index(), i);
        }
        assert!(Modality::Vision.detects_objects());
        assert!(!Modality::Imu.detects_objects());
    }
}
