//! Pipeline configuration.
//!
//! Every field has a default so partial TOML/JSON documents deserialize
//! cleanly. Call [`PipelineConfig::validate`] after loading.

use serde::{Deserialize, Serialize};

use crate::obstacle::Severity;
use crate::sample::Modality;
use crate::DriveError;

/// Base trust weight per modality before health and staleness scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityWeights {
    pub lidar: f64,
    pub radar: f64,
    pub vision: f64,
    pub gps: f64,
    pub imu: f64,
}

impl Default for ModalityWeights {
    fn default() -> Self {
        Self {
            lidar: 1.0,
            radar: 0.9,
            vision: 0.8,
            gps: 0.6,
            imu: 0.5,
        }
    }
}

impl ModalityWeights {
    pub fn get(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Lidar => self.lidar,
            Modality::Radar => self.radar,
            Modality::Vision => self.vision,
            Modality::Gps => self.gps,
            Modality::Imu => self.imu,
        }
    }
}

/// Severity lookup keyed by (collision-probability bucket, ttc bucket).
///
/// Probability buckets are split at `probability_bounds` (ascending), giving
/// four rows. Ttc buckets are split at `ttc_bounds_s` (descending) with
/// "not closing" in the first column, giving five columns:
/// `[none or > 8 s, (4, 8], (2, 4], (1, 2], ≤ 1]` with the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityTable {
    pub probability_bounds: [f64; 3],
    pub ttc_bounds_s: [f64; 4],
    pub cells: [[Severity; 5]; 4],
}

impl Default for SeverityTable {
    fn default() -> Self {
        use Severity::*;
        Self {
            probability_bounds: [0.2, 0.5, 0.8],
            ttc_bounds_s: [8.0, 4.0, 2.0, 1.0],
            cells: [
                [Minimal, Low, Low, Medium, High],
                [Low, Low, Medium, High, Critical],
                [Low, Medium, Medium, High, Critical],
                [Medium, Medium, High, High, Emergency],
            ],
        }
    }
}

impl SeverityTable {
    /// Row index for a collision probability.
    pub fn probability_bucket(&self, probability: f64) -> usize {
        self.probability_bounds
            .iter()
            .filter(|bound| probability >= **bound)
            .count()
    }

    /// Column index for a time-to-collision (`None` = not closing).
    pub fn ttc_bucket(&self, ttc_s: Option<f64>) -> usize {
        match ttc_s {
            None => 0,
            Some(ttc) => self.ttc_bounds_s.iter().filter(|bound| ttc <= **bound).count(),
        }
    }

    /// Generic (type-independent) severity for the given inputs.
    pub fn lookup(&self, probability: f64, ttc_s: Option<f64>) -> Severity {
        self.cells[self.probability_bucket(probability)][self.ttc_bucket(ttc_s)]
    }

    /// The table must never assign a lower severity to a riskier cell.
    pub fn is_monotonic(&self) -> bool {
        let rows_ok = self.cells.iter().all(|row| row.windows(2).all(|w| w[0] <= w[1]));
        let cols_ok = (0..5).all(|c| self.cells.windows(2).all(|w| w[0][c] <= w[1][c]));
        rows_ok && cols_ok
    }
}

/// Thresholds that make the path planner coordinator request a new route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalculationThresholds {
    /// Obstacles detected within the detection window.
    pub obstacle_threshold: usize,
    pub obstacle_window_ms: u64,
    pub deviation_threshold_m: f64,
    /// Environmental risk above which the route is recomputed.
    pub replan_environmental_risk: f64,
    /// Environmental risk at which the route waits for better conditions.
    pub hold_environmental_risk: f64,
    /// Distance to destination counted as arrival.
    pub arrival_tolerance_m: f64,
}

impl Default for RecalculationThresholds {
    fn default() -> Self {
        Self {
            obstacle_threshold: 5,
            obstacle_window_ms: 1_000,
            deviation_threshold_m: 50.0,
            replan_environmental_risk: 0.6,
            hold_environmental_risk: 0.85,
            arrival_tolerance_m: 2.0,
        }
    }
}

/// Configuration of one per-vehicle pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub staleness_bound_ms: u64,
    pub min_modalities_for_confidence: usize,
    pub recovery_window_ms: u64,
    pub max_recalculations_per_minute: u32,
    pub lateral_clearance_min_m: f64,

    /// End-to-end cycle budget.
    pub cycle_budget_ms: u64,
    /// Cycles slower than this count as overruns.
    pub hard_deadline_ms: u64,
    /// Consecutive overruns that constitute a hard fault.
    pub max_consecutive_overruns: usize,
    /// Consecutive stale cycles after which a modality is excluded.
    pub max_stale_cycles: u32,
    pub association_radius_m: f64,
    /// Confidence below which a cycle counts towards human takeover.
    pub low_confidence_threshold: f64,
    /// Consecutive low-confidence cycles that trigger human takeover.
    pub low_confidence_cycles: u32,
    /// Time-to-collision at or under which the machine enters Emergency.
    pub emergency_ttc_s: f64,
    pub vehicle_width_m: f64,
    /// Maximum braking deceleration used for stopping-distance estimates.
    pub max_deceleration_mps2: f64,
    /// Silence after which a modality counts as disconnected.
    pub sensor_timeout_ms: u64,

    pub modality_weights: ModalityWeights,
    pub severity_table: SeverityTable,
    pub recalculation: RecalculationThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staleness_bound_ms: 200,
            min_modalities_for_confidence: 2,
            recovery_window_ms: 1_500,
            max_recalculations_per_minute: 6,
            lateral_clearance_min_m: 1.0,
            cycle_budget_ms: 100,
            hard_deadline_ms: 250,
            max_consecutive_overruns: 3,
            max_stale_cycles: 3,
            association_radius_m: 1.5,
            low_confidence_threshold: 0.4,
            low_confidence_cycles: 2,
            emergency_ttc_s: 2.0,
            vehicle_width_m: 1.9,
            max_deceleration_mps2: 7.0,
            sensor_timeout_ms: 500,
            modality_weights: ModalityWeights::default(),
            severity_table: SeverityTable::default(),
            recalculation: RecalculationThresholds::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self) -> Result<(), DriveError> {
        if self.staleness_bound_ms == 0 {
            return Err(DriveError::Config("staleness_bound_ms must be > 0".into()));
        }
        if self.min_modalities_for_confidence == 0 {
            return Err(DriveError::Config(
                "min_modalities_for_confidence must be ≥ 1".into(),
            ));
        }
        if self.max_recalculations_per_minute == 0 {
            return Err(DriveError::Config(
                "max_recalculations_per_minute must be ≥ 1".into(),
            ));
        }
        if !(self.lateral_clearance_min_m.is_finite() && self.lateral_clearance_min_m >= 0.0) {
            return Err(DriveError::Config(
                "lateral_clearance_min_m must be a non-negative number".into(),
            ));
        }
        if self.cycle_budget_ms == 0 || self.hard_deadline_ms < self.cycle_budget_ms {
            return Err(DriveError::Config(format!(
                "hard_deadline_ms ({}) must be ≥ cycle_budget_ms ({}) > 0",
                self.hard_deadline_ms, self.cycle_budget_ms
            )));
        }
        if self.low_confidence_cycles == 0 || self.max_consecutive_overruns == 0 {
            return Err(DriveError::Config(
                "low_confidence_cycles and max_consecutive_overruns must be ≥ 1".into(),
            ));
        }
        for m in Modality::ALL {
            let w = self.modality_weights.get(m);
            if !(w.is_finite() && w >= 0.0) {
                return Err(DriveError::Config(format!("weight for {m} must be ≥ 0")));
            }
        }
        if !self.severity_table.is_monotonic() {
            return Err(DriveError::Config("severity table is not monotonic".into()));
        }
        let r = &self.recalculation;
        if r.hold_environmental_risk < r.replan_environmental_risk {
            return Err(DriveError::Config(
                "hold_environmental_risk must be ≥ replan_environmental_risk".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn default_table_is_monotonic() {
        assert!(SeverityTable::default().is_monotonic());
    }

    #[test]
    fn non_monotonic_table_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.severity_table.cells[3][4] = Severity::Minimal;
        assert!(matches!(cfg.validate(), Err(DriveError::Config(_))));
    }

    #[test]
    fn deadline_below_budget_is_rejected() {
        let cfg = PipelineConfig {
            hard_deadline_ms: 50,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn buckets() {
        let t = SeverityTable::default();
        assert_eq!(t.probability_bucket(0.0), 0);
        assert_eq!(t.probability_bucket(0.5), 2);
        assert_eq!(t.probability_bucket(0.95), 3);
        assert_eq!(t.ttc_bucket(None), 0);
        assert_eq!(t.ttc_bucket(Some(20.0)), 0);
        assert_eq!(t.ttc_bucket(Some(1.6)), 3);
        assert_eq!(t.ttc_bucket(Some(0.5)), 4);
        assert_eq!(t.lookup(0.95, Some(1.6)), Severity::High);
    }

    #[test]
    fn partial_document_uses_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"staleness_bound_ms": 150, "modality_weights": {"radar": 0.7}}"#)
                .unwrap();
        assert_eq!(cfg.staleness_bound_ms, 150);
        assert_eq!(cfg.recovery_window_ms, 1_500);
        assert_eq!(cfg.modality_weights.radar, 0.7);
        assert_eq!(cfg.modality_weights.lidar, 1.0);
    }
}
