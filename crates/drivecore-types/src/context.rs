//! External driving context: environment and lane geometry.
//!
//! None of this is sensed by the core itself; the surrounding system supplies
//! it through the ingestion boundary and the pipeline reads the latest value
//! at the start of each cycle.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    #[default]
    Clear,
    Cloudy,
    LightRain,
    HeavyRain,
    Fog,
    Snow,
    Ice,
}

impl Weather {
    /// Driving-suitability factor (1.0 = ideal).
    pub const fn factor(self) -> f64 {
        match self {
            Weather::Clear => 1.0,
            Weather::Cloudy => 0.95,
            Weather::LightRain => 0.85,
            Weather::HeavyRain => 0.7,
            Weather::Fog => 0.6,
            Weather::Snow => 0.5,
            Weather::Ice => 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RoadSurface {
    #[default]
    Dry,
    Wet,
    Construction,
    Damaged,
    Icy,
}

impl RoadSurface {
    /// Driving-suitability factor (1.0 = ideal).
    pub const fn factor(self) -> f64 {
        match self {
            RoadSurface::Dry => 1.0,
            RoadSurface::Wet => 0.85,
            RoadSurface::Construction => 0.75,
            RoadSurface::Damaged => 0.7,
            RoadSurface::Icy => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDensity {
    #[default]
    Low,
    Medium,
    High,
}

impl TrafficDensity {
    /// Risk contribution (0–1).
    pub const fn risk(self) -> f64 {
        match self {
            TrafficDensity::Low => 0.1,
            TrafficDensity::Medium => 0.4,
            TrafficDensity::High => 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentConditions {
    pub weather: Weather,
    pub road: RoadSurface,
    pub traffic: TrafficDensity,
}

/// Which lane the vehicle currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LanePosition {
    Left,
    #[default]
    Center,
    Right,
}

/// Adjacent-lane occupancy and lane-change geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LaneContext {
    pub position: LanePosition,
    pub left_lane_clear: bool,
    pub right_lane_clear: bool,
    /// Lateral deviation a lane change would introduce (metres).
    pub lane_change_deviation_m: f64,
    /// Maximum deviation the path planner tolerates without replanning.
    pub deviation_tolerance_m: f64,
}

impl Default for LaneContext {
    fn default() -> Self {
        Self {
            position: LanePosition::Center,
            left_lane_clear: false,
            right_lane_clear: false,
            lane_change_deviation_m: 3.5,
            deviation_tolerance_m: 4.0,
        }
    }
}

/// Free lateral space beside the most threatening obstacle (metres),
/// measured from the obstacle's edge to the next hazard or the road edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct LateralGap {
    pub left_m: f64,
    pub right_m: f64,
}

impl LateralGap {
    pub fn on(&self, side: crate::obstacle::Side) -> f64 {
        match side {
            crate::obstacle::Side::Left => self.left_m,
            crate::obstacle::Side::Right => self.right_m,
        }
    }
}

/// Everything the core needs from the outside world besides sensor data.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct DrivingContext {
    pub environment: EnvironmentConditions,
    pub lanes: LaneContext,
    pub lateral_gap: LateralGap,
}
