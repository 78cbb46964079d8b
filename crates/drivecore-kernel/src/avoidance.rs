//! [`AvoidancePlanner`] – picks the concrete maneuver for the most
//! threatening obstacle.
//!
//! The decision table maps (decision kind, obstacle type, lane position,
//! lateral clearance) to an [`AvoidanceAction`]:
//!
//! | Decision | Action |
//! |---|---|
//! | RequestHumanIntervention | RequestHumanControl |
//! | EmergencyStop | CompleteStop |
//! | EmergencyBrake | Swerve(side) if the vehicle cannot stop in time and the side has clearance, else EmergencyBrake |
//! | BrakeGradually | PullOver for emergency vehicles, FollowAtDistance behind slow vehicles, else ReduceSpeed |
//! | ChangeLane(side) | ChangeLane(side) if that lane exists and is clear, else ReduceSpeed |
//! | StopAndWait / Park / Reverse | WaitAndProceed / PullOver / Reverse |
//! | ContinueStraight, Turn | as BrakeGradually from Medium severity up, else NoAction |
//!
//! Effective clearance is the lateral gap beside the obstacle minus the
//! vehicle width. The [`ActionVerifier`] re-checks every selection.
//!
//! Single-sensor detections rated High or worse must be seen on two
//! consecutive cycles before an irreversible action is issued; until then
//! the planner issues `ReduceSpeed` and marks the record as awaiting
//! confirmation. A ttc of one second or less skips the wait.

use chrono::{DateTime, Utc};
use drivecore_types::{
    ActuatorFeedback, AiDecision, AvoidanceAction, AvoidanceRecord, DecisionKind, DrivingContext,
    LanePosition, ObstacleCandidate, ObstacleType, PipelineConfig, RiskAssessment, Severity, Side,
};
use tracing::{debug, info};

use crate::action_verifier::{ActionVerifier, SafetyContext};

/// Ttc at or below which confirmation is skipped.
const CONFIRMATION_BYPASS_TTC_S: f64 = 1.0;
/// How far a pending obstacle may move between cycles and still match.
const CONFIRMATION_RADIUS_M: f64 = 2.0;
/// Closing speed under which a vehicle ahead is followed rather than avoided.
const FOLLOW_MAX_CLOSING_MPS: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
struct PendingConfirmation {
    action: AvoidanceAction,
    obstacle_type: ObstacleType,
    position: (f64, f64),
}

/// Inputs for one planning step.
#[derive(Debug, Clone, Copy)]
pub struct AvoidanceInput<'a> {
    pub at: DateTime<Utc>,
    pub decision: &'a AiDecision,
    /// Most threatening obstacle and its assessment.
    pub threat: Option<(&'a ObstacleCandidate, &'a RiskAssessment)>,
    pub context: &'a DrivingContext,
    /// Ego speed; 0 when unknown.
    pub ego_speed_mps: f64,
}

pub struct AvoidancePlanner {
    lateral_clearance_min_m: f64,
    vehicle_width_m: f64,
    max_deceleration_mps2: f64,
    verifier: ActionVerifier,
    pending: Option<PendingConfirmation>,
    last: Option<AvoidanceRecord>,
}

impl AvoidancePlanner {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            lateral_clearance_min_m: config.lateral_clearance_min_m,
            vehicle_width_m: config.vehicle_width_m,
            max_deceleration_mps2: config.max_deceleration_mps2,
            verifier: ActionVerifier::with_default_rules(),
            pending: None,
            last: None,
        }
    }

    /// Replace the safety rules (the default set is installed by [`new`](Self::new)).
    pub fn with_verifier(mut self, verifier: ActionVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Select the action for this cycle. `None` when there is nothing to
    /// avoid or the table yields `NoAction`.
    pub fn plan(&mut self, input: &AvoidanceInput<'_>) -> Option<AvoidanceRecord> {
        let Some((candidate, risk)) = input.threat else {
            self.pending = None;
            return None;
        };

        let ctx = self.safety_context(input.context);
        let selected = self.select(input.decision.kind, candidate, risk, &ctx, input.ego_speed_mps);
        let mut action = self.verifier.enforce(selected, &ctx);
        if action == AvoidanceAction::NoAction {
            self.pending = None;
            return None;
        }

        let multi_sensor = candidate.is_multi_sensor_detection();
        let needs_confirmation = !multi_sensor
            && risk.severity >= Severity::High
            && action.is_irreversible()
            && !risk
                .time_to_collision
                .is_some_and(|t| t <= CONFIRMATION_BYPASS_TTC_S);

        let mut awaiting_confirmation = false;
        if needs_confirmation {
            if self.confirms(action, candidate) {
                info!(?action, obstacle = ?candidate.obstacle_type, "single-sensor detection confirmed");
                self.pending = None;
            } else {
                self.pending = Some(PendingConfirmation {
                    action,
                    obstacle_type: candidate.obstacle_type,
                    position: candidate.position(),
                });
                action = AvoidanceAction::ReduceSpeed;
                awaiting_confirmation = true;
            }
        } else {
            self.pending = None;
        }

        let record = AvoidanceRecord {
            obstacle: *candidate,
            severity: risk.severity,
            action,
            safety_margin_m: self.safety_margin(action, candidate, &ctx, input.ego_speed_mps),
            path_deviation_m: self.planned_deviation(action, candidate, input.context),
            is_multi_sensor_detection: multi_sensor,
            awaiting_confirmation,
            decision_confidence: input.decision.confidence,
            decided_at: input.at,
            outcome: None,
        };
        debug!(?action, severity = ?risk.severity, awaiting_confirmation, "avoidance action selected");
        self.last = Some(record);
        Some(record)
    }

    /// Attach actuator feedback to the last issued record.
    ///
    /// Returns the completed record, or `None` when there is no record
    /// waiting for an outcome.
    pub fn record_outcome(&mut self, feedback: ActuatorFeedback) -> Option<AvoidanceRecord> {
        let record = self.last.as_mut().filter(|r| r.outcome.is_none())?;
        record.complete(feedback);
        info!(
            action = ?record.action,
            collision_avoided = feedback.collision_avoided,
            safety_score = record.safety_score(),
            response = ?record.response_time_category(),
            "avoidance outcome recorded"
        );
        Some(*record)
    }

    /// The most recently issued record.
    pub fn last_record(&self) -> Option<&AvoidanceRecord> {
        self.last.as_ref()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Decision table
    // ────────────────────────────────────────────────────────────────────────

    fn select(
        &self,
        decision: DecisionKind,
        candidate: &ObstacleCandidate,
        risk: &RiskAssessment,
        ctx: &SafetyContext,
        ego_speed_mps: f64,
    ) -> AvoidanceAction {
        match decision {
            DecisionKind::RequestHumanIntervention => AvoidanceAction::RequestHumanControl,
            DecisionKind::EmergencyStop => AvoidanceAction::CompleteStop,
            DecisionKind::EmergencyBrake => self.emergency_maneuver(candidate, ctx, ego_speed_mps),
            DecisionKind::BrakeGradually => slow_down_for(candidate),
            DecisionKind::ChangeLane(side) => {
                let lanes = &ctx.lanes;
                let open = match side {
                    Side::Left => lanes.position != LanePosition::Left && lanes.left_lane_clear,
                    Side::Right => lanes.position != LanePosition::Right && lanes.right_lane_clear,
                };
                if open {
                    AvoidanceAction::ChangeLane(side)
                } else {
                    AvoidanceAction::ReduceSpeed
                }
            }
            DecisionKind::StopAndWait => AvoidanceAction::WaitAndProceed,
            DecisionKind::Park => AvoidanceAction::PullOver,
            DecisionKind::Reverse => AvoidanceAction::Reverse,
            DecisionKind::ContinueStraight | DecisionKind::Turn(_) => {
                if risk.severity >= Severity::Medium {
                    slow_down_for(candidate)
                } else {
                    AvoidanceAction::NoAction
                }
            }
        }
    }

    /// Swerve only when braking alone cannot stop short of the obstacle and
    /// a side offers enough clearance.
    fn emergency_maneuver(
        &self,
        candidate: &ObstacleCandidate,
        ctx: &SafetyContext,
        ego_speed_mps: f64,
    ) -> AvoidanceAction {
        if self.stopping_distance(ego_speed_mps) >= candidate.distance_m {
            let preferred = Side::away_from(candidate.bearing_rad);
            if let Some(side) = [preferred, preferred.opposite()]
                .into_iter()
                .find(|s| ctx.effective_clearance(*s) >= self.lateral_clearance_min_m)
            {
                return AvoidanceAction::Swerve(side);
            }
        }
        AvoidanceAction::EmergencyBrake
    }

    fn confirms(&self, action: AvoidanceAction, candidate: &ObstacleCandidate) -> bool {
        self.pending.is_some_and(|p| {
            let (x, y) = candidate.position();
            p.action == action
                && p.obstacle_type == candidate.obstacle_type
                && (x - p.position.0).hypot(y - p.position.1) <= CONFIRMATION_RADIUS_M
        })
    }

    fn safety_context(&self, context: &DrivingContext) -> SafetyContext {
        SafetyContext {
            effective_clearance_left_m: context.lateral_gap.left_m - self.vehicle_width_m,
            effective_clearance_right_m: context.lateral_gap.right_m - self.vehicle_width_m,
            lateral_clearance_min_m: self.lateral_clearance_min_m,
            lanes: context.lanes,
        }
    }

    fn stopping_distance(&self, speed_mps: f64) -> f64 {
        speed_mps * speed_mps / (2.0 * self.max_deceleration_mps2)
    }

    /// Clearance left after the maneuver: lateral for swerves, longitudinal
    /// for everything else.
    fn safety_margin(
        &self,
        action: AvoidanceAction,
        candidate: &ObstacleCandidate,
        ctx: &SafetyContext,
        ego_speed_mps: f64,
    ) -> f64 {
        match action {
            AvoidanceAction::Swerve(side) => ctx.effective_clearance(side).max(0.0),
            _ => (candidate.distance_m - self.stopping_distance(ego_speed_mps)).max(0.0),
        }
    }

    fn planned_deviation(
        &self,
        action: AvoidanceAction,
        candidate: &ObstacleCandidate,
        context: &DrivingContext,
    ) -> f64 {
        match action {
            AvoidanceAction::Swerve(_) => {
                let (_, y) = candidate.position();
                let needed = candidate.width_m / 2.0 + self.vehicle_width_m / 2.0 + self.lateral_clearance_min_m;
                (needed - y.abs()).max(0.0)
            }
            AvoidanceAction::ChangeLane(_) | AvoidanceAction::PullOver => {
                context.lanes.lane_change_deviation_m
            }
            _ => 0.0,
        }
    }
}

fn slow_down_for(candidate: &ObstacleCandidate) -> AvoidanceAction {
    match candidate.obstacle_type {
        ObstacleType::EmergencyVehicle => AvoidanceAction::PullOver,
        ObstacleType::Vehicle | ObstacleType::Motorcyclist
            if candidate.relative_speed_mps < FOLLOW_MAX_CLOSING_MPS =>
        {
            AvoidanceAction::FollowAtDistance
        }
        _ => AvoidanceAction::ReduceSpeed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_types::{LaneContext, LateralGap, Modality};
    use proptest::prelude::*;

    fn t() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn obstacle(obstacle_type: ObstacleType, distance: f64, modalities: &[Modality]) -> ObstacleCandidate {
        ObstacleCandidate {
            id: 0,
            obstacle_type,
            distance_m: distance,
            bearing_rad: 0.0,
            relative_speed_mps: 5.0,
            width_m: 0.6,
            detected_by: modalities.iter().copied().collect(),
            agreement: 0.9,
        }
    }

    fn risk(severity: Severity, ttc: Option<f64>) -> RiskAssessment {
        RiskAssessment {
            collision_probability: 0.9,
            time_to_collision: ttc,
            environmental_risk: 0.0,
            severity,
        }
    }

    fn context(left: f64, right: f64) -> DrivingContext {
        DrivingContext {
            lateral_gap: LateralGap { left_m: left, right_m: right },
            ..DrivingContext::default()
        }
    }

    fn plan(
        p: &mut AvoidancePlanner,
        kind: DecisionKind,
        c: &ObstacleCandidate,
        r: &RiskAssessment,
        ctx: &DrivingContext,
        speed: f64,
    ) -> Option<AvoidanceRecord> {
        let decision = AiDecision::new(kind, 1.0);
        p.plan(&AvoidanceInput {
            at: t(),
            decision: &decision,
            threat: Some((c, r)),
            context: ctx,
            ego_speed_mps: speed,
        })
    }

    fn planner() -> AvoidancePlanner {
        AvoidancePlanner::new(&PipelineConfig::default())
    }

    #[test]
    fn emergency_brake_when_stopping_is_possible() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Pedestrian, 8.0, &[Modality::Lidar, Modality::Radar]);
        let rec = plan(&mut p, DecisionKind::EmergencyBrake, &c, &risk(Severity::Critical, Some(1.6)), &context(5.0, 5.0), 5.0)
            .expect("record");
        assert_eq!(rec.action, AvoidanceAction::EmergencyBrake);
        assert!(rec.is_multi_sensor_detection);
        assert!(!rec.awaiting_confirmation);
    }

    #[test]
    fn swerves_when_too_fast_to_stop_and_side_is_clear() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Debris, 10.0, &[Modality::Lidar, Modality::Radar]);
        // 20 m/s → 28.6 m to stop
        let rec = plan(&mut p, DecisionKind::EmergencyBrake, &c, &risk(Severity::Critical, Some(0.5)), &context(3.5, 0.5), 20.0)
            .unwrap();
        assert_eq!(rec.action, AvoidanceAction::Swerve(Side::Left));
        assert!((rec.safety_margin_m - 1.6).abs() < 1e-9);

        let blocked = plan(&mut p, DecisionKind::EmergencyBrake, &c, &risk(Severity::Critical, Some(0.5)), &context(2.5, 2.5), 20.0)
            .unwrap();
        assert_eq!(blocked.action, AvoidanceAction::EmergencyBrake);
    }

    #[test]
    fn nominal_low_risk_yields_no_record() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Vehicle, 40.0, &[Modality::Vision]);
        assert!(plan(&mut p, DecisionKind::ContinueStraight, &c, &risk(Severity::Minimal, Some(20.0)), &context(0.0, 0.0), 10.0).is_none());

        let decision = AiDecision::new(DecisionKind::EmergencyBrake, 1.0);
        let none = p.plan(&AvoidanceInput {
            at: t(),
            decision: &decision,
            threat: None,
            context: &DrivingContext::default(),
            ego_speed_mps: 0.0,
        });
        assert!(none.is_none());
    }

    #[test]
    fn slow_vehicle_is_followed_and_emergency_vehicle_gets_way() {
        let mut p = planner();
        let mut car = obstacle(ObstacleType::Vehicle, 20.0, &[Modality::Radar]);
        car.relative_speed_mps = 1.0;
        let rec = plan(&mut p, DecisionKind::BrakeGradually, &car, &risk(Severity::Medium, Some(20.0)), &context(0.0, 0.0), 10.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::FollowAtDistance);

        let ambulance = obstacle(ObstacleType::EmergencyVehicle, 30.0, &[Modality::Radar]);
        let rec = plan(&mut p, DecisionKind::ContinueStraight, &ambulance, &risk(Severity::Medium, None), &context(0.0, 0.0), 10.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::PullOver);
    }

    #[test]
    fn lane_change_needs_open_lane() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Vehicle, 15.0, &[Modality::Lidar, Modality::Radar]);
        let mut ctx = context(0.0, 0.0);
        let rec = plan(&mut p, DecisionKind::ChangeLane(Side::Left), &c, &risk(Severity::High, Some(3.0)), &ctx, 10.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::ReduceSpeed);

        ctx.lanes = LaneContext {
            left_lane_clear: true,
            ..LaneContext::default()
        };
        let rec = plan(&mut p, DecisionKind::ChangeLane(Side::Left), &c, &risk(Severity::High, Some(3.0)), &ctx, 10.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::ChangeLane(Side::Left));
        assert_eq!(rec.path_deviation_m, 3.5);
    }

    #[test]
    fn single_sensor_irreversible_action_waits_one_cycle() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Animal, 12.0, &[Modality::Vision]);
        let r = risk(Severity::High, Some(3.0));
        let ctx = context(0.0, 0.0);

        let first = plan(&mut p, DecisionKind::EmergencyStop, &c, &r, &ctx, 0.0).unwrap();
        assert_eq!(first.action, AvoidanceAction::ReduceSpeed);
        assert!(first.awaiting_confirmation);

        let second = plan(&mut p, DecisionKind::EmergencyStop, &c, &r, &ctx, 0.0).unwrap();
        assert_eq!(second.action, AvoidanceAction::CompleteStop);
        assert!(!second.awaiting_confirmation);
    }

    #[test]
    fn imminent_impact_skips_confirmation() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Animal, 3.0, &[Modality::Vision]);
        let rec = plan(&mut p, DecisionKind::EmergencyStop, &c, &risk(Severity::Emergency, Some(0.6)), &context(0.0, 0.0), 0.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::CompleteStop);
        assert!(!rec.awaiting_confirmation);
    }

    #[test]
    fn multi_sensor_irreversible_action_is_immediate() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Animal, 12.0, &[Modality::Vision, Modality::Lidar]);
        let rec = plan(&mut p, DecisionKind::EmergencyStop, &c, &risk(Severity::High, Some(3.0)), &context(0.0, 0.0), 0.0).unwrap();
        assert_eq!(rec.action, AvoidanceAction::CompleteStop);
    }

    #[test]
    fn record_outcome_completes_last_record_once() {
        let mut p = planner();
        let c = obstacle(ObstacleType::Pedestrian, 8.0, &[Modality::Lidar, Modality::Radar]);
        plan(&mut p, DecisionKind::EmergencyBrake, &c, &risk(Severity::Critical, Some(1.6)), &context(0.0, 0.0), 5.0).unwrap();

        let feedback = ActuatorFeedback {
            executed_successfully: true,
            collision_avoided: true,
            path_deviation_m: 0.0,
            executed_at: t() + chrono::Duration::milliseconds(120),
        };
        let done = p.record_outcome(feedback).expect("completed");
        assert_eq!(done.outcome.map(|o| o.response_time_ms), Some(120));
        assert!(p.record_outcome(feedback).is_none());
    }

    fn side_strategy() -> impl Strategy<Value = Side> {
        prop_oneof![Just(Side::Left), Just(Side::Right)]
    }

    proptest! {
        /// A swerve is only ever issued into a side with the minimum
        /// effective clearance.
        #[test]
        fn swerve_respects_clearance(
            left in 0.0f64..6.0,
            right in 0.0f64..6.0,
            distance in 0.5f64..60.0,
            bearing in -0.6f64..0.6,
            speed in 0.0f64..35.0,
            change_side in side_strategy(),
            kind_index in 0usize..4,
        ) {
            let kind = [
                DecisionKind::EmergencyBrake,
                DecisionKind::BrakeGradually,
                DecisionKind::ChangeLane(change_side),
                DecisionKind::ContinueStraight,
            ][kind_index];
            let config = PipelineConfig::default();
            let mut p = AvoidancePlanner::new(&config);
            let mut c = obstacle(ObstacleType::Unknown, distance, &[Modality::Lidar, Modality::Radar]);
            c.bearing_rad = bearing;
            let ctx = context(left, right);
            if let Some(rec) = plan(&mut p, kind, &c, &risk(Severity::Critical, Some(1.0)), &ctx, speed)
                && let AvoidanceAction::Swerve(side) = rec.action
            {
                let gap = ctx.lateral_gap.on(side);
                prop_assert!(gap - config.vehicle_width_m >= config.lateral_clearance_min_m);
            }
        }
    }
}
