//! Route state owned by the path planner coordinator.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of the active route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    #[default]
    Planning,
    Active,
    Recalculating,
    Paused,
    Completed,
    Cancelled,
    Error,
    WaitingForConditions,
    /// Terminal within the coordinator until an explicit resume.
    HumanInterventionRequired,
}

impl RouteStatus {
    /// States the route never leaves on its own.
    pub const fn is_final(self) -> bool {
        matches!(self, RouteStatus::Completed | RouteStatus::Cancelled)
    }
}

/// Path-search algorithms a routing strategy can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanningAlgorithm {
    AStar,
    Dijkstra,
    Rrt,
    RrtStar,
    HybridAStar,
    StraightLine,
}

/// Why a new path was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecalculationReason {
    InitialPlan,
    ObstacleDensity,
    PathDeviation,
    UpstreamEmergency,
    EnvironmentalConditions,
    PendingRequest,
    Retry,
}

/// A point in the local east/north frame (metres).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Waypoint {
    pub east_m: f64,
    pub north_m: f64,
}

impl Waypoint {
    pub const fn new(east_m: f64, north_m: f64) -> Self {
        Self { east_m, north_m }
    }

    pub fn distance_to(&self, other: &Waypoint) -> f64 {
        (self.east_m - other.east_m).hypot(self.north_m - other.north_m)
    }
}

/// Total length of a polyline.
pub fn path_length(waypoints: &[Waypoint]) -> f64 {
    waypoints.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
}

/// Progress metrics of the active route.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RouteProgress {
    pub total_distance_m: f64,
    pub remaining_distance_m: f64,
    /// Deviation accumulated from avoidance maneuvers since the last plan.
    pub cumulative_deviation_m: f64,
    pub recalculations: u32,
    pub avoidance_maneuvers: u32,
    pub emergency_stops: u32,
}

impl RouteProgress {
    /// Completed share of the route, 0–100.
    pub fn percent_complete(&self) -> f64 {
        if self.total_distance_m <= 0.0 {
            return 0.0;
        }
        let done = self.total_distance_m - self.remaining_distance_m;
        (done / self.total_distance_m * 100.0).clamp(0.0, 100.0)
    }
}

/// Coarse rating of how a route went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceRating {
    Excellent,
    VeryGood,
    Good,
    Fair,
    NeedsImprovement,
}

/// The route, its waypoints and progress.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RouteState {
    pub status: RouteStatus,
    pub waypoints: Vec<Waypoint>,
    pub destination: Option<Waypoint>,
    pub progress: RouteProgress,
    pub algorithm: Option<PlanningAlgorithm>,
    /// Incremented on every accepted plan.
    pub generation: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RouteState {
    /// Rating from avoidance activity and emergency stops along the route.
    pub fn performance_rating(&self) -> PerformanceRating {
        let p = &self.progress;
        let penalty = f64::from(p.emergency_stops) * 0.1
            + f64::from(p.avoidance_maneuvers) * 0.02
            + f64::from(p.recalculations) * 0.02;
        let score = (1.0 - penalty).max(0.0);
        if score >= 0.9 {
            PerformanceRating::Excellent
        } else if score >= 0.8 {
            PerformanceRating::VeryGood
        } else if score >= 0.7 {
            PerformanceRating::Good
        } else if score >= 0.6 {
            PerformanceRating::Fair
        } else {
            PerformanceRating::NeedsImprovement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_complete_is_clamped() {
        let p = RouteProgress {
            total_distance_m: 200.0,
            remaining_distance_m: 50.0,
            ..Default::default()
        };
        assert!((p.percent_complete() - 75.0).abs() < 1e-9);

        let empty = RouteProgress::default();
        assert_eq!(empty.percent_complete(), 0.0);
    }

    #[test]
    fn path_length_sums_segments() {
        let path = [Waypoint::new(0.0, 0.0), Waypoint::new(3.0, 4.0), Waypoint::new(3.0, 10.0)];
        assert!((path_length(&path) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn performance_rating_drops_with_emergency_stops() {
        let mut route = RouteState::default();
        assert_eq!(route.performance_rating(), PerformanceRating::Excellent);
        route.progress.emergency_stops = 2;
        route.progress.avoidance_maneuvers = 2;
        assert_eq!(route.performance_rating(), PerformanceRating::Good);
        route.progress.emergency_stops = 6;
        assert_eq!(route.performance_rating(), PerformanceRating::NeedsImprovement);
    }
}
