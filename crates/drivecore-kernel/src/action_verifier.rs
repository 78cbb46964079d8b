//! [`ActionVerifier`] – safety interlock for avoidance actions.
//!
//! The avoidance planner's decision table already respects clearance and
//! lane limits; every selected action is checked again here before it leaves
//! the planner. Each registered [`SafetyRule`] is evaluated in order. A
//! violation names a fallback action, which is then verified in turn, so the
//! result always satisfies every rule.
//!
//! Built-in rules:
//! - [`SwerveClearanceRule`] – `Swerve(side)` needs at least the minimum
//!   effective lateral clearance on that side; falls back to `EmergencyBrake`.
//! - [`LaneBoundaryRule`] – `ChangeLane(side)` needs an existing, clear lane
//!   on that side; falls back to `ReduceSpeed`.

use drivecore_types::{AvoidanceAction, LaneContext, LanePosition, Side};
use tracing::warn;

/// Geometry an action is checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyContext {
    /// Lateral gap beside the obstacle minus the vehicle width, per side.
    pub effective_clearance_left_m: f64,
    pub effective_clearance_right_m: f64,
    pub lateral_clearance_min_m: f64,
    pub lanes: LaneContext,
}

impl SafetyContext {
    pub fn effective_clearance(&self, side: Side) -> f64 {
        match side {
            Side::Left => self.effective_clearance_left_m,
            Side::Right => self.effective_clearance_right_m,
        }
    }
}

/// A rule violation and the action to use instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub rule: &'static str,
    pub details: String,
    pub fallback: AvoidanceAction,
}

/// A single safety invariant an avoidance action must satisfy.
pub trait SafetyRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, action: AvoidanceAction, ctx: &SafetyContext) -> Result<(), Violation>;
}

#[derive(Default)]
pub struct ActionVerifier {
    rules: Vec<Box<dyn SafetyRule>>,
}

impl ActionVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier with [`SwerveClearanceRule`] and [`LaneBoundaryRule`].
    pub fn with_default_rules() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(SwerveClearanceRule));
        v.add_rule(Box::new(LaneBoundaryRule));
        v
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn SafetyRule>) {
        self.rules.push(rule);
    }

    /// First violation, or `Ok(())` when every rule passes.
    pub fn verify(&self, action: AvoidanceAction, ctx: &SafetyContext) -> Result<(), Violation> {
        for rule in &self.rules {
            rule.check(action, ctx)?;
        }
        Ok(())
    }

    /// Replace `action` with fallbacks until every rule passes.
    ///
    /// Gives up with `EmergencyBrake` if the fallbacks keep violating rules.
    pub fn enforce(&self, action: AvoidanceAction, ctx: &SafetyContext) -> AvoidanceAction {
        let mut current = action;
        for _ in 0..=self.rules.len() {
            match self.verify(current, ctx) {
                Ok(()) => return current,
                Err(v) => {
                    warn!(rule = v.rule, details = %v.details, ?current, fallback = ?v.fallback, "avoidance action replaced");
                    current = v.fallback;
                }
            }
        }
        AvoidanceAction::EmergencyBrake
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

pub struct SwerveClearanceRule;

impl SafetyRule for SwerveClearanceRule {
    fn name(&self) -> &'static str {
        "swerve_clearance"
    }

    fn check(&self, action: AvoidanceAction, ctx: &SafetyContext) -> Result<(), Violation> {
        if let AvoidanceAction::Swerve(side) = action {
            let clearance = ctx.effective_clearance(side);
            if !(clearance >= ctx.lateral_clearance_min_m) {
                return Err(Violation {
                    rule: self.name(),
                    details: format!(
                        "{side:?} clearance {clearance:.2} m below minimum {:.2} m",
                        ctx.lateral_clearance_min_m
                    ),
                    fallback: AvoidanceAction::EmergencyBrake,
                });
            }
        }
        Ok(())
    }
}

pub struct LaneBoundaryRule;

impl SafetyRule for LaneBoundaryRule {
    fn name(&self) -> &'static str {
        "lane_boundary"
    }

    fn check(&self, action: AvoidanceAction, ctx: &SafetyContext) -> Result<(), Violation> {
        if let AvoidanceAction::ChangeLane(side) = action {
            let lanes = &ctx.lanes;
            let (exists, clear) = match side {
                Side::Left => (lanes.position != LanePosition::Left, lanes.left_lane_clear),
                Side::Right => (lanes.position != LanePosition::Right, lanes.right_lane_clear),
            };
            if !exists || !clear {
                return Err(Violation {
                    rule: self.name(),
                    details: format!("no clear {side:?} lane from {:?}", lanes.position),
                    fallback: AvoidanceAction::ReduceSpeed,
                });
            }
        }
        Ok(())
    }
}
