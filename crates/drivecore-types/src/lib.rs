//! `drivecore-types` – shared vocabulary of the perception-to-action core.
//!
//! Every value that crosses a stage or crate boundary lives here so the
//! pipeline stages depend on one small crate instead of on each other.
//!
//! # Modules
//!
//! - [`sample`] – raw [`SensorSample`]s, SI-unit [`NormalizedSample`]s and the
//!   [`Modality`] catalogue.
//! - [`obstacle`] – fused [`ObstacleCandidate`]s, [`Severity`] and
//!   [`RiskAssessment`].
//! - [`decision`] – the decision state machine vocabulary and avoidance
//!   records.
//! - [`route`] – [`RouteState`] owned by the path planner coordinator.
//! - [`context`] – environment and lane context supplied from outside.
//! - [`config`] – [`PipelineConfig`].

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod config;
pub mod context;
pub mod decision;
pub mod obstacle;
pub mod route;
pub mod sample;

pub use config::{ModalityWeights, PipelineConfig, RecalculationThresholds, SeverityTable};
pub use context::{
    DrivingContext, EnvironmentConditions, LaneContext, LanePosition, LateralGap, RoadSurface,
    TrafficDensity, Weather,
};
pub use decision::{
    ActuatorFeedback, AiDecision, AvoidanceAction, AvoidanceOutcome, AvoidanceRecord,
    ComfortImpact, DecisionKind, DriveState, ResponseTimeCategory,
};
pub use obstacle::{ObstacleCandidate, ObstacleType, RiskAssessment, Severity, Side};
pub use route::{
    PerformanceRating, PlanningAlgorithm, RecalculationReason, RouteProgress, RouteState,
    RouteStatus, Waypoint, path_length,
};
pub use sample::{
    Angle, Detection, Length, Modality, ModalitySet, NormalizedPayload, NormalizedSample,
    RawDetection, SensorPayload, SensorSample, Speed,
};

// ────────────────────────────────────────────────────────────────────────────
// Identity
// ────────────────────────────────────────────────────────────────────────────

/// Identifier of one vehicle; every sample and record is tagged with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VehicleId(String);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Errors surfaced by the core's public operations.
///
/// Per-sample input problems are not errors; the normalizer reports them as
/// rejections and the cycle carries on.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriveError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Routing failed: {0}")]
    Routing(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Unknown vehicle: {0}")]
    UnknownVehicle(VehicleId),

    #[error("Sample for vehicle {got} pushed into pipeline of {expected}")]
    VehicleMismatch { expected: VehicleId, got: VehicleId },

    #[error("Hard fault on {vehicle}: {details}")]
    HardFault { vehicle: VehicleId, details: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DriveError {
    fn from(e: serde_json::Error) -> Self {
        DriveError::Serialization(e.to_string())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Health
// ────────────────────────────────────────────────────────────────────────────

/// Coarse health tier of one modality, from its rolling score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Failed,
    Failing,
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.9 => HealthStatus::Excellent,
            s if s >= 0.8 => HealthStatus::Good,
            s if s >= 0.7 => HealthStatus::Fair,
            s if s >= 0.5 => HealthStatus::Poor,
            s if s >= 0.3 => HealthStatus::Critical,
            s if s >= 0.1 => HealthStatus::Failing,
            _ => HealthStatus::Failed,
        }
    }

    pub const fn is_healthy(self) -> bool {
        matches!(self, HealthStatus::Excellent | HealthStatus::Good)
    }
}

/// Rolling health of one modality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensorHealth {
    pub modality: Modality,
    /// Rolling score in `[0, 1]`, used as the fusion trust multiplier.
    pub score: f64,
    pub status: HealthStatus,
    pub connected: bool,
    pub rejections: u64,
    pub degraded: bool,
}

/// Per-cycle health snapshot published on the telemetry topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensorHealthReport {
    pub vehicle_id: VehicleId,
    pub at: DateTime<Utc>,
    pub sensors: Vec<SensorHealth>,
}

// ────────────────────────────────────────────────────────────────────────────
// Cycle output
// ────────────────────────────────────────────────────────────────────────────

/// Compact view of a fusion frame for publication.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct FusionSummary {
    pub fusion_confidence: f64,
    pub sensor_agreement: f64,
    pub data_consistency: f64,
    pub present: ModalitySet,
    pub stale: ModalitySet,
    pub degraded: ModalitySet,
    pub outliers: usize,
    pub obstacle_count: usize,
    pub aggregate_risk: RiskAssessment,
}

/// Everything one pipeline cycle produced, published on the decisions topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CycleRecord {
    pub vehicle_id: VehicleId,
    /// Cycle counter, starting at 1.
    pub cycle: u64,
    pub cycle_time: DateTime<Utc>,
    pub state: DriveState,
    pub decision: AiDecision,
    pub avoidance: Option<AvoidanceRecord>,
    pub route: RouteState,
    pub fusion: FusionSummary,
    /// Avoidance and planning were skipped because the cycle budget ran out;
    /// their previous outputs are repeated.
    pub degraded_output: bool,
}

/// JSON Schema of [`CycleRecord`] for downstream consumers.
pub fn cycle_record_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(CycleRecord)
}

// ────────────────────────────────────────────────────────────────────────────
// Alerts & events
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    DegradedModeEntered { modality: Modality },
    DegradedModeCleared { modality: Modality },
    HumanTakeover,
    HumanInterventionRequired,
    AutonomyResumed,
    HardFault,
    OperatorStop,
}

/// Operator-facing alert; the core hands these to the alerting boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Alert {
    pub vehicle_id: VehicleId,
    pub kind: AlertKind,
    pub message: String,
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// `"<vehicle>::<component>"`, e.g. `"av-1::pipeline"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Cycle(Box<CycleRecord>),
    Alert(Alert),
    Health(SensorHealthReport),
    /// An avoidance record whose execution outcome is known.
    Avoidance(Box<AvoidanceRecord>),
}
