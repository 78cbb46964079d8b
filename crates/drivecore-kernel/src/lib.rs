//! `drivecore-kernel` – Decisions & Safety
//!
//! Turns a scored frame into exactly one driving decision per cycle and one
//! concrete avoidance action, and keeps track of sensor health. Everything
//! here is synchronous and driven by the caller's clock.
//!
//! # Modules
//!
//! - [`decision`] – [`DecisionStateMachine`][decision::DecisionStateMachine]:
//!   priority-ordered rules over `Nominal / Caution / Emergency /
//!   HumanTakeover` with an Emergency recovery window.
//! - [`avoidance`] – [`AvoidancePlanner`][avoidance::AvoidancePlanner]:
//!   maps the decision and the most threatening obstacle to an
//!   [`AvoidanceAction`][drivecore_types::AvoidanceAction], including
//!   single-sensor confirmation and outcome scoring.
//! - [`action_verifier`] – [`ActionVerifier`][action_verifier::ActionVerifier]:
//!   a rule engine that re-checks every avoidance action against lateral
//!   clearance and lane boundaries and substitutes a safe fallback.
//! - [`health`] – [`HealthMonitor`][health::HealthMonitor]:
//!   heartbeats and rolling per-modality health scores that feed the fusion
//!   engine's trust weights.

pub mod action_verifier;
pub mod avoidance;
pub mod decision;
pub mod health;

pub use action_verifier::{
    ActionVerifier, LaneBoundaryRule, SafetyContext, SafetyRule, SwerveClearanceRule, Violation,
};
pub use avoidance::{AvoidanceInput, AvoidancePlanner};
pub use decision::{DecisionInput, DecisionOutcome, DecisionStateMachine, lane_change_side};
pub use health::{HealthEvent, HealthMonitor, HealthObservation};
