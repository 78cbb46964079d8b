//! `drivecore-perception` – from raw sensor samples to scored obstacles.
//!
//! The three leading stages of every cycle live here. They are synchronous
//! and hold only per-vehicle state, so a pipeline owns one instance of each.
//!
//! # Modules
//!
//! - [`normalizer`] – [`SensorNormalizer`][normalizer::SensorNormalizer]:
//!   validates raw samples, converts units and rejects stale or malformed
//!   input.
//! - [`association`] – greedy spatial clustering of detections across
//!   modalities.
//! - [`fusion`] – [`FusionEngine`][fusion::FusionEngine]: trust-weighted
//!   fusion into a [`FusionFrame`][fusion::FusionFrame] with confidence,
//!   agreement, outlier exclusion and ego state.
//! - [`risk`] – [`RiskScorer`][risk::RiskScorer]: time-to-collision,
//!   collision probability, severity and environmental risk.

pub mod association;
pub mod fusion;
pub mod normalizer;
pub mod risk;

pub use fusion::{DegradedTransition, EgoState, FusionEngine, FusionFrame, Reading};
pub use normalizer::{RejectReason, SensorNormalizer, StaleKind};
pub use risk::{FrameRisk, RiskScorer, ScoredObstacle};
