//! Driving decisions and avoidance actions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::obstacle::{ObstacleCandidate, Severity, Side};

/// Operating state of the decision state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DriveState {
    #[default]
    Nominal,
    Caution,
    Emergency,
    /// Terminal until an explicit resume-autonomy signal.
    HumanTakeover,
}

/// What the vehicle should do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "decision", content = "side", rename_all = "snake_case")]
pub enum DecisionKind {
    ContinueStraight,
    Turn(Side),
    BrakeGradually,
    EmergencyBrake,
    ChangeLane(Side),
    StopAndWait,
    Reverse,
    Park,
    EmergencyStop,
    RequestHumanIntervention,
}

impl DecisionKind {
    /// Dispatch priority, 1 (routine) to 10 (must pre-empt everything).
    pub const fn priority(self) -> u8 {
        match self {
            DecisionKind::ContinueStraight => 1,
            DecisionKind::Turn(_) => 2,
            DecisionKind::ChangeLane(_) => 3,
            DecisionKind::Park => 3,
            DecisionKind::Reverse => 4,
            DecisionKind::BrakeGradually => 5,
            DecisionKind::StopAndWait => 6,
            DecisionKind::EmergencyBrake => 9,
            DecisionKind::EmergencyStop => 10,
            DecisionKind::RequestHumanIntervention => 10,
        }
    }
}

/// The single active decision of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AiDecision {
    pub kind: DecisionKind,
    pub confidence: f64,
    pub priority: u8,
}

impl AiDecision {
    pub fn new(kind: DecisionKind, confidence: f64) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            priority: kind.priority(),
        }
    }
}

/// Concrete maneuver selected for one obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", content = "side", rename_all = "snake_case")]
pub enum AvoidanceAction {
    NoAction,
    ReduceSpeed,
    EmergencyBrake,
    Swerve(Side),
    ChangeLane(Side),
    Reverse,
    CompleteStop,
    WaitAndProceed,
    RequestHumanControl,
    PullOver,
    FollowAtDistance,
}

impl AvoidanceAction {
    /// Actions that cannot be taken back within the next cycle.
    pub const fn is_irreversible(self) -> bool {
        matches!(self, AvoidanceAction::CompleteStop | AvoidanceAction::Reverse)
    }

    /// Passenger comfort impact of the maneuver.
    pub const fn comfort_impact(self) -> ComfortImpact {
        match self {
            AvoidanceAction::EmergencyBrake | AvoidanceAction::Swerve(_) => ComfortImpact::Significant,
            AvoidanceAction::ChangeLane(_) | AvoidanceAction::ReduceSpeed => ComfortImpact::Moderate,
            _ => ComfortImpact::Minimal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComfortImpact {
    Minimal,
    Moderate,
    Significant,
}

/// Bucketed end-to-end response time of an executed maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseTimeCategory {
    Excellent,
    VeryGood,
    Good,
    Acceptable,
    Slow,
    Unknown,
}

/// Actuator confirmation of an executed maneuver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActuatorFeedback {
    pub executed_successfully: bool,
    pub collision_avoided: bool,
    pub path_deviation_m: f64,
    pub executed_at: DateTime<Utc>,
}

/// Outcome fields populated once the actuator confirms execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AvoidanceOutcome {
    pub executed_successfully: bool,
    pub collision_avoided: bool,
    pub path_deviation_m: f64,
    pub response_time_ms: i64,
}

/// An avoidance action bound to the obstacle it answers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AvoidanceRecord {
    pub obstacle: ObstacleCandidate,
    pub severity: Severity,
    pub action: AvoidanceAction,
    /// Lateral clearance left after the maneuver (metres).
    pub safety_margin_m: f64,
    /// Planned lateral deviation from the route (metres).
    pub path_deviation_m: f64,
    pub is_multi_sensor_detection: bool,
    /// An irreversible action is being held for one confirmation cycle.
    pub awaiting_confirmation: bool,
    pub decision_confidence: f64,
    pub decided_at: DateTime<Utc>,
    pub outcome: Option<AvoidanceOutcome>,
}

impl AvoidanceRecord {
    /// Fill the outcome fields from actuator feedback.
    pub fn complete(&mut self, feedback: ActuatorFeedback) {
        let response_time_ms = (feedback.executed_at - self.decided_at)
            .num_milliseconds()
            .max(0);
        self.path_deviation_m = feedback.path_deviation_m;
        self.outcome = Some(AvoidanceOutcome {
            executed_successfully: feedback.executed_successfully,
            collision_avoided: feedback.collision_avoided,
            path_deviation_m: feedback.path_deviation_m,
            response_time_ms,
        });
    }

    pub fn response_time_category(&self) -> ResponseTimeCategory {
        match self.outcome.map(|o| o.response_time_ms) {
            None => ResponseTimeCategory::Unknown,
            Some(ms) if ms <= 100 => ResponseTimeCategory::Excellent,
            Some(ms) if ms <= 250 => ResponseTimeCategory::VeryGood,
            Some(ms) if ms <= 500 => ResponseTimeCategory::Good,
            Some(ms) if ms <= 1000 => ResponseTimeCategory::Acceptable,
            Some(_) => ResponseTimeCategory::Slow,
        }
    }

    /// Composite 0–100 safety score of an executed maneuver.
    ///
    /// Collision avoided (30) + safety margin (2 per metre, max 20) +
    /// response time (25, minus 1 per 40 ms) + decision confidence (25).
    pub fn safety_score(&self) -> f64 {
        let mut score = self.safety_margin_m.max(0.0) * 2.0;
        score = score.min(20.0);
        score += self.decision_confidence * 25.0;
        if let Some(outcome) = self.outcome {
            if outcome.collision_avoided {
                score += 30.0;
            }
            score += (25.0 - outcome.response_time_ms as f64 / 40.0).max(0.0);
        }
        score.min(100.0)
    }

    /// The maneuver worked and nobody had to take over.
    pub fn was_successful(&self) -> bool {
        self.outcome
            .is_some_and(|o| o.executed_successfully && o.collision_avoided)
            && self.action != AvoidanceAction::RequestHumanControl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obstacle::ObstacleType;
    use crate::sample::ModalitySet;
    use chrono::Duration;

    fn record() -> AvoidanceRecord {
        AvoidanceRecord {
            obstacle: ObstacleCandidate {
                id: 0,
                obstacle_type: ObstacleType::Pedestrian,
                distance_m: 8.0,
                bearing_rad: 0.0,
                relative_speed_mps: 5.0,
                width_m: 0.6,
                detected_by: ModalitySet::empty(),
                agreement: 0.5,
            },
            severity: Severity::Critical,
            action: AvoidanceAction::EmergencyBrake,
            safety_margin_m: 4.0,
            path_deviation_m: 0.0,
            is_multi_sensor_detection: false,
            awaiting_confirmation: false,
            decision_confidence: 1.0,
            decided_at: Utc::now(),
            outcome: None,
        }
    }

    #[test]
    fn priorities_rank_emergencies_highest() {
        assert_eq!(DecisionKind::EmergencyStop.priority(), 10);
        assert!(DecisionKind::EmergencyBrake.priority() > DecisionKind::BrakeGradually.priority());
        assert_eq!(DecisionKind::ContinueStraight.priority(), 1);
    }

    #[test]
    fn ai_decision_clamps_confidence() {
        let d = AiDecision::new(DecisionKind::BrakeGradually, 1.7);
        assert_eq!(d.confidence, 1.0);
        assert_eq!(d.priority, 5);
    }

    #[test]
    fn complete_fills_outcome_and_response_time() {
        let mut r = record();
        let at = r.decided_at + Duration::milliseconds(80);
        r.complete(ActuatorFeedback {
            executed_successfully: true,
            collision_avoided: true,
            path_deviation_m: 0.4,
            executed_at: at,
        });
        let outcome = r.outcome.expect("outcome set");
        assert_eq!(outcome.response_time_ms, 80);
        assert_eq!(r.response_time_category(), ResponseTimeCategory::Excellent);
        assert!(r.was_successful());
        // 8 (margin) + 25 (confidence) + 30 (avoided) + 23 (response)
        assert!((r.safety_score() - 86.0).abs() < 1e-9);
    }

    #[test]
    fn pending_record_has_unknown_response_time() {
        let r = record();
        assert_eq!(r.response_time_category(), ResponseTimeCategory::Unknown);
        assert!(!r.was_successful());
    }

    #[test]
    fn comfort_impact_table() {
        assert_eq!(AvoidanceAction::Swerve(Side::Left).comfort_impact(), ComfortImpact::Significant);
        assert_eq!(AvoidanceAction::ReduceSpeed.comfort_impact(), ComfortImpact::Moderate);
        assert_eq!(AvoidanceAction::NoAction.comfort_impact(), ComfortImpact::Minimal);
    }

    #[test]
    fn decision_kind_serializes_with_side() {
        let json = serde_json::to_string(&DecisionKind::ChangeLane(Side::Left)).unwrap();
        let back: DecisionKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DecisionKind::ChangeLane(Side::Left));
    }
}
