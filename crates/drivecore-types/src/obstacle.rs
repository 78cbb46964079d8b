//! Obstacle candidates and their risk assessments.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::sample::ModalitySet;

/// Classification of a detected obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObstacleType {
    Vehicle,
    Pedestrian,
    Cyclist,
    Motorcyclist,
    Animal,
    ConstructionBarrier,
    TrafficCone,
    Pothole,
    Debris,
    ParkedVehicle,
    EmergencyVehicle,
    Unknown,
}

impl ObstacleType {
    /// Road users whose presence alone raises the minimum severity.
    pub const fn is_vulnerable(self) -> bool {
        matches!(
            self,
            ObstacleType::Pedestrian | ObstacleType::Cyclist | ObstacleType::EmergencyVehicle
        )
    }

    /// Obstacles that do not move on their own.
    pub const fn is_static(self) -> bool {
        matches!(
            self,
            ObstacleType::ConstructionBarrier
                | ObstacleType::TrafficCone
                | ObstacleType::Pothole
                | ObstacleType::Debris
                | ObstacleType::ParkedVehicle
        )
    }
}

/// Discrete risk tier, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Minimal,
    Low,
    Medium,
    High,
    Critical,
    Emergency,
}

impl Severity {
    /// One level up, saturating at [`Severity::Emergency`].
    pub const fn promoted(self) -> Severity {
        match self {
            Severity::Minimal => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical | Severity::Emergency => Severity::Emergency,
        }
    }

    /// `true` for the tiers that force an emergency response.
    pub const fn is_critical(self) -> bool {
        matches!(self, Severity::Critical | Severity::Emergency)
    }
}

/// Lateral direction of a maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// The side facing away from an object at `bearing_rad`
    /// (counter-clockwise positive, so a positive bearing is on the left).
    pub fn away_from(bearing_rad: f64) -> Side {
        if bearing_rad > 0.0 { Side::Right } else { Side::Left }
    }
}

/// A fused obstacle estimate, cheap to copy between stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObstacleCandidate {
    /// Index of the candidate within its frame.
    pub id: u32,
    pub obstacle_type: ObstacleType,
    pub distance_m: f64,
    /// Counter-clockwise positive, zero straight ahead.
    pub bearing_rad: f64,
    /// Closing speed; positive when the gap is shrinking.
    pub relative_speed_mps: f64,
    pub width_m: f64,
    pub detected_by: ModalitySet,
    /// Cross-modality agreement for this object (0.5 when single-sensor).
    pub agreement: f64,
}

impl ObstacleCandidate {
    /// Independently corroborated by at least two modalities.
    pub fn is_multi_sensor_detection(&self) -> bool {
        self.detected_by.len() >= 2
    }

    /// Position in the vehicle frame (x forward, y left), metres.
    pub fn position(&self) -> (f64, f64) {
        (
            self.distance_m * self.bearing_rad.cos(),
            self.distance_m * self.bearing_rad.sin(),
        )
    }
}

/// Risk derived for one obstacle or for a whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RiskAssessment {
    pub collision_probability: f64,
    /// Seconds until impact; `None` when the gap is not closing.
    pub time_to_collision: Option<f64>,
    pub environmental_risk: f64,
    pub severity: Severity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Minimal < Severity::Low);
        assert!(Severity::High < Severity::Critical);
        assert!(Severity::Critical < Severity::Emergency);
    }

    #[test]
    fn promotion_saturates() {
        assert_eq!(Severity::High.promoted(), Severity::Critical);
        assert_eq!(Severity::Emergency.promoted(), Severity::Emergency);
    }

    #[test]
    fn vulnerable_types() {
        assert!(ObstacleType::Pedestrian.is_vulnerable());
        assert!(ObstacleType::EmergencyVehicle.is_vulnerable());
        assert!(!ObstacleType::Vehicle.is_vulnerable());
    }

    #[test]
    fn side_away_from_bearing() {
        assert_eq!(Side::away_from(0.3), Side::Right);
        assert_eq!(Side::away_from(-0.3), Side::Left);
    }
}
