//! [`DecisionStateMachine`] – bounded-latency driving decisions.
//!
//! Every cycle the machine consumes one [`DecisionInput`] and yields exactly
//! one [`AiDecision`]. Rules are evaluated in priority order; the first match
//! wins:
//!
//! | # | Condition | State | Decision |
//! |---|---|---|---|
//! | 0 | already in HumanTakeover, or a hard fault | HumanTakeover | RequestHumanIntervention |
//! | 1 | low confidence or sensor loss for N consecutive cycles | HumanTakeover | RequestHumanIntervention |
//! | 2 | severity Critical/Emergency, or ttc ≤ emergency ttc | Emergency | EmergencyBrake (EmergencyStop when stationary) |
//! | 3 | aggregate severity High | Caution | ChangeLane(side) if a lane is usable, else BrakeGradually |
//! | 4 | otherwise | Nominal | pending route maneuver or ContinueStraight |
//!
//! Leaving Emergency always goes through Caution, which is held for the
//! recovery window after the last critical cycle. HumanTakeover is only left
//! through [`DecisionStateMachine::resume_autonomy`].
//!
//! A cycle without any fresh sensor data never yields ContinueStraight; it
//! is held in Caution with BrakeGradually until rule 1 escalates.

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{
    AiDecision, DecisionKind, DriveState, LaneContext, LanePosition, ObstacleCandidate,
    PipelineConfig, RiskAssessment, Severity, Side,
};
use tracing::{info, warn};

/// Everything the state machine looks at in one cycle.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub at: DateTime<Utc>,
    pub fusion_confidence: f64,
    /// No modality delivered a fresh sample this cycle.
    pub sensor_loss: bool,
    /// The overrun guard declared a hard fault.
    pub hard_fault: bool,
    pub aggregate: RiskAssessment,
    /// The most threatening obstacle, if any.
    pub threat: Option<&'a ObstacleCandidate>,
    pub ego_stationary: bool,
    pub lanes: &'a LaneContext,
    /// Maneuver suggested by the path planner coordinator.
    pub pending_maneuver: Option<DecisionKind>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionOutcome {
    pub decision: AiDecision,
    pub state: DriveState,
    pub previous: DriveState,
}

impl DecisionOutcome {
    pub fn transitioned(&self) -> bool {
        self.state != self.previous
    }
}

#[derive(Debug)]
pub struct DecisionStateMachine {
    state: DriveState,
    low_confidence_streak: u32,
    /// Start of the current recovery window (set when Emergency is left).
    recovery_started: Option<DateTime<Utc>>,
    low_confidence_threshold: f64,
    low_confidence_cycles: u32,
    emergency_ttc_s: f64,
    recovery_window: Duration,
}

impl DecisionStateMachine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            state: DriveState::Nominal,
            low_confidence_streak: 0,
            recovery_started: None,
            low_confidence_threshold: config.low_confidence_threshold,
            low_confidence_cycles: config.low_confidence_cycles,
            emergency_ttc_s: config.emergency_ttc_s,
            recovery_window: Duration::milliseconds(config.recovery_window_ms as i64),
        }
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    /// Evaluate one cycle.
    pub fn step(&mut self, input: &DecisionInput<'_>) -> DecisionOutcome {
        let previous = self.state;
        let decision = self.evaluate(input);
        if self.state != previous {
            match self.state {
                DriveState::HumanTakeover => warn!(from = ?previous, "human takeover requested"),
                DriveState::Emergency => warn!(from = ?previous, "entering emergency"),
                to => info!(from = ?previous, ?to, "drive state changed"),
            }
        }
        DecisionOutcome {
            decision,
            state: self.state,
            previous,
        }
    }

    /// Leave HumanTakeover after an explicit operator signal. Re-enters
    /// Caution with a fresh recovery window. Returns `false` when the
    /// machine was not in HumanTakeover.
    pub fn resume_autonomy(&mut self, at: DateTime<Utc>) -> bool {
        if self.state != DriveState::HumanTakeover {
            return false;
        }
        info!("autonomy resumed");
        self.state = DriveState::Caution;
        self.low_confidence_streak = 0;
        self.recovery_started = Some(at);
        true
    }

    /// Force HumanTakeover from outside the cycle (e.g. an operator stop).
    pub fn force_takeover(&mut self) {
        self.state = DriveState::HumanTakeover;
    }

    fn evaluate(&mut self, input: &DecisionInput<'_>) -> AiDecision {
        let takeover = || AiDecision::new(DecisionKind::RequestHumanIntervention, 1.0);

        // Rule 0
        if self.state == DriveState::HumanTakeover {
            return takeover();
        }
        if input.hard_fault {
            self.state = DriveState::HumanTakeover;
            return takeover();
        }

        // Rule 1
        let low = input.sensor_loss || input.fusion_confidence < self.low_confidence_threshold;
        self.low_confidence_streak = if low { self.low_confidence_streak + 1 } else { 0 };
        if self.low_confidence_streak >= self.low_confidence_cycles {
            self.state = DriveState::HumanTakeover;
            return takeover();
        }

        // Rule 2
        let aggregate = &input.aggregate;
        let critical = aggregate.severity.is_critical()
            || aggregate
                .time_to_collision
                .is_some_and(|t| t <= self.emergency_ttc_s);
        if critical {
            self.state = DriveState::Emergency;
            self.recovery_started = None;
            let kind = if input.ego_stationary {
                DecisionKind::EmergencyStop
            } else {
                DecisionKind::EmergencyBrake
            };
            return AiDecision::new(kind, 1.0);
        }

        if self.state == DriveState::Emergency {
            self.recovery_started = Some(input.at);
        }
        let recovering = self
            .recovery_started
            .is_some_and(|t| input.at - t < self.recovery_window);
        if !recovering {
            self.recovery_started = None;
        }
        let confidence = input.fusion_confidence;

        // Rule 3
        if aggregate.severity >= Severity::High {
            self.state = DriveState::Caution;
            let kind = match lane_change_side(input.threat, input.lanes) {
                Some(side) => DecisionKind::ChangeLane(side),
                None => DecisionKind::BrakeGradually,
            };
            return AiDecision::new(kind, confidence);
        }

        if recovering || input.sensor_loss {
            self.state = DriveState::Caution;
            return AiDecision::new(DecisionKind::BrakeGradually, confidence);
        }

        // Rule 4
        self.state = DriveState::Nominal;
        let kind = input
            .pending_maneuver
            .unwrap_or(DecisionKind::ContinueStraight);
        AiDecision::new(kind, confidence)
    }
}

/// The adjacent lane to move into, trying the side away from the threat
/// first. `None` when neither lane is clear or the deviation is too large.
pub fn lane_change_side(threat: Option<&ObstacleCandidate>, lanes: &LaneContext) -> Option<Side> {
    if lanes.lane_change_deviation_m > lanes.deviation_tolerance_m {
        return None;
    }
    let preferred = threat.map_or(Side::Left, |t| Side::away_from(t.bearing_rad));
    [preferred, preferred.opposite()]
        .into_iter()
        .find(|side| lane_usable(*side, lanes))
}

fn lane_usable(side: Side, lanes: &LaneContext) -> bool {
    match side {
        Side::Left => lanes.left_lane_clear && lanes.position != LanePosition::Left,
        Side::Right => lanes.right_lane_clear && lanes.position != LanePosition::Right,
    }
}
