//! Risk Scorer.
//!
//! Derives a [`RiskAssessment`] for every fused obstacle and one aggregate
//! for the frame.
//!
//! ```text
//! ttc         = distance / closing_speed            (None unless closing)
//! probability = time_factor(ttc) × bearing_factor(offset)
//! severity    = table[probability bucket][ttc bucket], then type promotion
//! ```
//!
//! The time factor is 1 at `ttc ≤ 1 s` and falls linearly to 0 at 8 s. The
//! bearing factor is 1 while the obstacle's near edge is inside the vehicle
//! corridor and falls to 0 over one further corridor width. Anything behind
//! the vehicle scores 0.

use drivecore_types::{
    EnvironmentConditions, ObstacleCandidate, PipelineConfig, RiskAssessment, Severity,
    SeverityTable,
};

const TTC_CERTAIN_S: f64 = 1.0;
const TTC_IRRELEVANT_S: f64 = 8.0;
/// Closing speeds below this are treated as not closing.
const MIN_CLOSING_SPEED_MPS: f64 = 1e-3;
/// Margin added to half the vehicle width to form the corridor half-width.
const CORRIDOR_MARGIN_M: f64 = 0.5;

/// One candidate with its assessment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredObstacle {
    pub candidate: ObstacleCandidate,
    pub risk: RiskAssessment,
}

/// All assessments of a frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameRisk {
    pub obstacles: Vec<ScoredObstacle>,
    pub aggregate: RiskAssessment,
}

impl FrameRisk {
    /// Highest severity first, then higher probability, then sooner impact.
    pub fn most_threatening(&self) -> Option<&ScoredObstacle> {
        self.obstacles.iter().max_by(|a, b| {
            a.risk
                .severity
                .cmp(&b.risk.severity)
                .then(a.risk.collision_probability.total_cmp(&b.risk.collision_probability))
                .then_with(|| {
                    let ttc = |s: &ScoredObstacle| s.risk.time_to_collision.unwrap_or(f64::INFINITY);
                    ttc(b).total_cmp(&ttc(a))
                })
        })
    }
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    table: SeverityTable,
    corridor_half_width_m: f64,
}

impl RiskScorer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            table: config.severity_table.clone(),
            corridor_half_width_m: config.vehicle_width_m / 2.0 + CORRIDOR_MARGIN_M,
        }
    }

    pub fn assess(&self, candidate: &ObstacleCandidate, environmental_risk: f64) -> RiskAssessment {
        let time_to_collision = time_to_collision(candidate.distance_m, candidate.relative_speed_mps);
        let collision_probability =
            (time_factor(time_to_collision) * self.bearing_factor(candidate)).clamp(0.0, 1.0);

        let mut severity = self.table.lookup(collision_probability, time_to_collision);
        if candidate.obstacle_type.is_vulnerable() {
            severity = severity.promoted().max(Severity::Medium);
        }

        RiskAssessment {
            collision_probability,
            time_to_collision,
            environmental_risk,
            severity,
        }
    }

    /// Score every candidate and aggregate.
    pub fn score_frame(
        &self,
        candidates: &[ObstacleCandidate],
        environment: &EnvironmentConditions,
    ) -> FrameRisk {
        let environmental_risk = environmental_risk(environment);
        let obstacles: Vec<ScoredObstacle> = candidates
            .iter()
            .map(|c| ScoredObstacle {
                candidate: *c,
                risk: self.assess(c, environmental_risk),
            })
            .collect();
        let aggregate = aggregate(obstacles.iter().map(|s| &s.risk), environmental_risk);
        FrameRisk { obstacles, aggregate }
    }

    fn bearing_factor(&self, candidate: &ObstacleCandidate) -> f64 {
        let (x, y) = candidate.position();
        if x <= 0.0 {
            return 0.0;
        }
        let edge_offset = (y.abs() - candidate.width_m / 2.0).max(0.0);
        let half = self.corridor_half_width_m;
        if edge_offset <= half {
            1.0
        } else {
            (1.0 - (edge_offset - half) / (2.0 * half)).max(0.0)
        }
    }
}

pub fn time_to_collision(distance_m: f64, closing_speed_mps: f64) -> Option<f64> {
    (closing_speed_mps > 0.0).then(|| distance_m / closing_speed_mps.max(MIN_CLOSING_SPEED_MPS))
}

fn time_factor(ttc: Option<f64>) -> f64 {
    match ttc {
        None => 0.0,
        Some(t) if t <= TTC_CERTAIN_S => 1.0,
        Some(t) => ((TTC_IRRELEVANT_S - t) / (TTC_IRRELEVANT_S - TTC_CERTAIN_S)).clamp(0.0, 1.0),
    }
}

/// Clamped weighted sum of weather (0.4), road (0.35) and traffic (0.25) risk.
pub fn environmental_risk(env: &EnvironmentConditions) -> f64 {
    let weather = 1.0 - env.weather.factor();
    let road = 1.0 - env.road.factor();
    (0.4 * weather + 0.35 * road + 0.25 * env.traffic.risk()).clamp(0.0, 1.0)
}

/// Worst severity, maximum probability and minimum ttc.
pub fn aggregate<'a>(
    assessments: impl IntoIterator<Item = &'a RiskAssessment>,
    environmental_risk: f64,
) -> RiskAssessment {
    assessments.into_iter().fold(
        RiskAssessment {
            environmental_risk,
            ..RiskAssessment::default()
        },
        |acc, r| RiskAssessment {
            collision_probability: acc.collision_probability.max(r.collision_probability),
            time_to_collision: match (acc.time_to_collision, r.time_to_collision) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            environmental_risk,
            severity: acc.severity.max(r.severity),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_types::{ModalitySet, ObstacleType, RoadSurface, TrafficDensity, Weather};
    use proptest::prelude::*;

    fn candidate(obstacle_type: ObstacleType, distance: f64, closing: f64, bearing: f64) -> ObstacleCandidate {
        ObstacleCandidate {
            id: 0,
            obstacle_type,
            distance_m: distance,
            bearing_rad: bearing,
            relative_speed_mps: closing,
            width_m: 0.6,
            detected_by: ModalitySet::empty(),
            agreement: 1.0,
        }
    }

    fn scorer() -> RiskScorer {
        RiskScorer::new(&PipelineConfig::default())
    }

    #[test]
    fn close_pedestrian_is_critical() {
        let r = scorer().assess(&candidate(ObstacleType::Pedestrian, 8.0, 5.0, 0.0), 0.0);
        assert!((r.time_to_collision.unwrap() - 1.6).abs() < 1e-9);
        assert!((r.collision_probability - 6.4 / 7.0).abs() < 1e-9);
        assert_eq!(r.severity, Severity::Critical);
    }

    #[test]
    fn distant_slow_vehicle_is_minimal() {
        let r = scorer().assess(&candidate(ObstacleType::Vehicle, 40.0, 2.0, 0.0), 0.0);
        assert_eq!(r.time_to_collision, Some(20.0));
        assert_eq!(r.collision_probability, 0.0);
        assert_eq!(r.severity, Severity::Minimal);
    }

    #[test]
    fn receding_obstacle_has_no_ttc() {
        let r = scorer().assess(&candidate(ObstacleType::Vehicle, 10.0, -3.0, 0.0), 0.0);
        assert_eq!(r.time_to_collision, None);
        assert_eq!(r.collision_probability, 0.0);
    }

    #[test]
    fn vulnerable_types_are_at_least_medium() {
        let r = scorer().assess(&candidate(ObstacleType::Cyclist, 60.0, 0.0, 0.0), 0.0);
        assert_eq!(r.severity, Severity::Medium);
    }

    #[test]
    fn obstacles_behind_or_far_aside_do_not_threaten() {
        let s = scorer();
        let behind = s.assess(&candidate(ObstacleType::Vehicle, 5.0, 5.0, std::f64::consts::PI), 0.0);
        assert_eq!(behind.collision_probability, 0.0);

        // 10 m to the side at 45°: well outside the corridor.
        let aside = s.assess(&candidate(ObstacleType::Vehicle, 14.2, 14.0, 0.785), 0.0);
        assert_eq!(aside.collision_probability, 0.0);
    }

    #[test]
    fn environmental_risk_from_conditions() {
        let clear = EnvironmentConditions::default();
        assert!((environmental_risk(&clear) - 0.025).abs() < 1e-9);

        let foggy = EnvironmentConditions {
            weather: Weather::Fog,
            road: RoadSurface::Wet,
            traffic: TrafficDensity::High,
        };
        // 0.4·0.4 + 0.35·0.15 + 0.25·0.8
        assert!((environmental_risk(&foggy) - 0.4125).abs() < 1e-9);
    }

    #[test]
    fn aggregate_takes_worst_case() {
        let s = scorer();
        let risk = s.score_frame(
            &[
                candidate(ObstacleType::Vehicle, 40.0, 2.0, 0.0),
                candidate(ObstacleType::Pedestrian, 8.0, 5.0, 0.0),
            ],
            &EnvironmentConditions::default(),
        );
        assert_eq!(risk.aggregate.severity, Severity::Critical);
        assert!((risk.aggregate.time_to_collision.unwrap() - 1.6).abs() < 1e-9);
        assert_eq!(
            risk.most_threatening().map(|s| s.candidate.obstacle_type),
            Some(ObstacleType::Pedestrian)
        );
    }

    #[test]
    fn empty_frame_aggregate_is_minimal() {
        let risk = scorer().score_frame(&[], &EnvironmentConditions::default());
        assert_eq!(risk.aggregate.severity, Severity::Minimal);
        assert_eq!(risk.aggregate.time_to_collision, None);
        assert!(risk.most_threatening().is_none());
    }

    proptest! {
        /// Closer, faster-closing obstacles are never rated less severe.
        #[test]
        fn severity_is_monotonic_in_threat(
            distance in 1.0f64..80.0,
            closing in 0.1f64..30.0,
            shrink in 0.1f64..1.0,
            speedup in 1.0f64..3.0,
        ) {
            let s = scorer();
            let far = s.assess(&candidate(ObstacleType::Vehicle, distance, closing, 0.0), 0.0);
            let near = s.assess(
                &candidate(ObstacleType::Vehicle, distance * shrink, closing * speedup, 0.0),
                0.0,
            );
            prop_assert!(near.severity >= far.severity);
            prop_assert!(near.collision_probability >= far.collision_probability);
        }

        #[test]
        fn probability_stays_in_unit_interval(
            distance in 0.0f64..200.0,
            closing in -50.0f64..50.0,
            bearing in -3.2f64..3.2,
        ) {
            let r = scorer().assess(&candidate(ObstacleType::Unknown, distance, closing, bearing), 0.3);
            prop_assert!((0.0..=1.0).contains(&r.collision_probability));
        }
    }
}
