//! Fusion Engine.
//!
//! Combines the per-modality [`NormalizedSample`]s of one cycle into a single
//! immutable [`FusionFrame`]: trust-weighted readings, a fusion confidence,
//! cross-sensor agreement, fused [`ObstacleCandidate`]s and the ego state.
//!
//! # Trust weights
//!
//! ```text
//! weight(m) = base_weight(m) × health(m) × (0.5 if stale else 1.0)
//! ```
//!
//! `health(m)` is the score the health monitor published at the end of the
//! previous cycle.
//!
//! # Confidence
//!
//! `fusion_confidence` is the weighted mean of the readings' quality. It is
//! capped at 0.5 when fewer than `min_modalities_for_confidence` modalities
//! are present, or when no modality delivered a fresh sample this cycle.
//!
//! # Stale readings
//!
//! The [`InputTracker`] reuses a modality's last sample (flagged stale) for
//! at most `max_stale_cycles` consecutive cycles, then excludes the modality
//! and raises a degraded-mode transition. A fresh sample clears it.
//!
//! # Ego heading
//!
//! Heading is blended with a complementary filter:
//! ```text
//! heading = α · (heading_gps + ω_imu · dt) + (1 − α) · heading_gps
//! ```
//! where `dt` is the age of the Gps fix at frame time.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{
    FusionSummary, Modality, ModalitySet, ModalityWeights, NormalizedPayload, NormalizedSample,
    ObstacleCandidate, ObstacleType, PipelineConfig, RiskAssessment,
};
use tracing::{debug, info, warn};

use crate::association::{Cluster, Observation, associate};

/// Complementary-filter coefficient for the ego heading.
const HEADING_ALPHA: f64 = 0.98;
/// Outlier threshold in standard deviations.
const OUTLIER_SIGMAS: f64 = 3.0;
/// Confidence ceiling when coverage is insufficient.
const DEGRADED_CONFIDENCE_CAP: f64 = 0.5;

// ────────────────────────────────────────────────────────────────────────────
// Frame types
// ────────────────────────────────────────────────────────────────────────────

/// One modality's contribution to a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sample: Arc<NormalizedSample>,
    /// The sample was carried over from an earlier cycle.
    pub stale: bool,
    pub weight: f64,
}

/// Vehicle state derived from the Gps and Imu readings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EgoState {
    pub east_m: f64,
    pub north_m: f64,
    pub heading_rad: f64,
    /// `None` until the first Gps fix.
    pub speed_mps: Option<f64>,
    pub yaw_rate_rps: f64,
    pub longitudinal_accel_mps2: f64,
    pub lateral_accel_mps2: f64,
}

impl EgoState {
    /// Known to be (almost) standing still.
    pub fn is_stationary(&self) -> bool {
        self.speed_mps.is_some_and(|v| v.abs() < 0.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateField {
    Distance,
    ClosingSpeed,
}

/// A modality estimate excluded from an object's fused value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outlier {
    pub obstacle_id: u32,
    pub modality: Modality,
    pub field: EstimateField,
    pub value: f64,
    /// Cross-modality reference the value was compared against.
    pub reference: f64,
}

/// A modality entered or left degraded mode this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedTransition {
    Entered(Modality),
    Cleared(Modality),
}

/// The fused view of one cycle. Immutable once built.
#[derive(Debug, Clone)]
pub struct FusionFrame {
    pub frame_time: DateTime<Utc>,
    /// Indexed by [`Modality::index`]; `None` for absent or excluded modalities.
    pub readings: [Option<Reading>; Modality::COUNT],
    pub fusion_confidence: f64,
    pub sensor_agreement: f64,
    pub data_consistency: f64,
    pub outliers: Vec<Outlier>,
    pub candidates: Vec<ObstacleCandidate>,
    pub ego: EgoState,
    /// Modalities currently excluded after too many stale cycles.
    pub degraded: ModalitySet,
    pub transitions: Vec<DegradedTransition>,
}

impl FusionFrame {
    pub fn reading(&self, modality: Modality) -> Option<&Reading> {
        self.readings[modality.index()].as_ref()
    }

    pub fn present(&self) -> ModalitySet {
        Modality::ALL
            .into_iter()
            .filter(|m| self.reading(*m).is_some())
            .collect()
    }

    pub fn fresh(&self) -> ModalitySet {
        Modality::ALL
            .into_iter()
            .filter(|m| self.reading(*m).is_some_and(|r| !r.stale))
            .collect()
    }

    pub fn stale(&self) -> ModalitySet {
        Modality::ALL
            .into_iter()
            .filter(|m| self.reading(*m).is_some_and(|r| r.stale))
            .collect()
    }

    /// No modality delivered anything new this cycle.
    pub fn is_sensor_loss(&self) -> bool {
        self.fresh().is_empty()
    }

    /// Agreement contribution of `modality`: the mean agreement of the
    /// objects it helped detect, 1.0 when it detected nothing.
    pub fn agreement_of(&self, modality: Modality) -> f64 {
        let scores: Vec<f64> = self
            .candidates
            .iter()
            .filter(|c| c.detected_by.contains(modality))
            .map(|c| c.agreement)
            .collect();
        if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    pub fn summary(&self, aggregate_risk: RiskAssessment) -> FusionSummary {
        FusionSummary {
            fusion_confidence: self.fusion_confidence,
            sensor_agreement: self.sensor_agreement,
            data_consistency: self.data_consistency,
            present: self.present(),
            stale: self.stale(),
            degraded: self.degraded,
            outliers: self.outliers.len(),
            obstacle_count: self.candidates.len(),
            aggregate_risk,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// InputTracker
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Slot {
    last: Option<Arc<NormalizedSample>>,
    stale_cycles: u32,
    excluded: bool,
}

/// Per-modality input held across cycles.
#[derive(Debug)]
pub struct InputTracker {
    slots: [Slot; Modality::COUNT],
    max_stale_cycles: u32,
}

/// What the tracker hands the engine for one cycle.
#[derive(Debug, Default)]
pub struct TrackedInputs {
    /// `(sample, stale)` per modality.
    pub inputs: [Option<(Arc<NormalizedSample>, bool)>; Modality::COUNT],
    pub degraded: ModalitySet,
    pub transitions: Vec<DegradedTransition>,
}

impl InputTracker {
    pub fn new(max_stale_cycles: u32) -> Self {
        Self {
            slots: Default::default(),
            max_stale_cycles,
        }
    }

    /// Advance one cycle. `fresh` holds at most one new sample per modality;
    /// when several are given the highest sequence number wins.
    pub fn advance(&mut self, fresh: impl IntoIterator<Item = NormalizedSample>) -> TrackedInputs {
        let mut incoming: [Option<NormalizedSample>; Modality::COUNT] = Default::default();
        for sample in fresh {
            let slot = &mut incoming[sample.modality.index()];
            if slot.as_ref().is_none_or(|s| s.sequence_id < sample.sequence_id) {
                *slot = Some(sample);
            }
        }

        let mut out = TrackedInputs::default();
        for modality in Modality::ALL {
            let i = modality.index();
            let slot = &mut self.slots[i];
            match incoming[i].take() {
                Some(sample) => {
                    let sample = Arc::new(sample);
                    slot.last = Some(Arc::clone(&sample));
                    slot.stale_cycles = 0;
                    if slot.excluded {
                        slot.excluded = false;
                        out.transitions.push(DegradedTransition::Cleared(modality));
                    }
                    out.inputs[i] = Some((sample, false));
                }
                None => {
                    let Some(last) = slot.last.as_ref() else {
                        continue;
                    };
                    slot.stale_cycles = slot.stale_cycles.saturating_add(1);
                    if slot.stale_cycles > self.max_stale_cycles {
                        if !slot.excluded {
                            slot.excluded = true;
                            out.transitions.push(DegradedTransition::Entered(modality));
                        }
                    } else {
                        out.inputs[i] = Some((Arc::clone(last), true));
                    }
                }
            }
            if slot.excluded {
                out.degraded.insert(modality);
            }
        }
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ────────────────────────────────────────────────────────────────────────────

/// Per-vehicle fusion engine. Holds the input tracker and the last ego state.
#[derive(Debug)]
pub struct FusionEngine {
    weights: ModalityWeights,
    min_modalities: usize,
    association_radius_m: f64,
    association_window: Duration,
    tracker: InputTracker,
    ego: EgoState,
}

impl FusionEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            weights: config.modality_weights,
            min_modalities: config.min_modalities_for_confidence,
            association_radius_m: config.association_radius_m,
            association_window: Duration::milliseconds(config.cycle_budget_ms as i64),
            tracker: InputTracker::new(config.max_stale_cycles),
            ego: EgoState::default(),
        }
    }

    /// Fuse this cycle's fresh samples. `health` holds the per-modality
    /// health scores from the previous cycle, indexed by [`Modality::index`].
    pub fn fuse(
        &mut self,
        fresh: impl IntoIterator<Item = NormalizedSample>,
        health: &[f64; Modality::COUNT],
        frame_time: DateTime<Utc>,
    ) -> FusionFrame {
        let tracked = self.tracker.advance(fresh);
        for t in &tracked.transitions {
            match t {
                DegradedTransition::Entered(m) => warn!(modality = %m, "modality excluded, degraded mode"),
                DegradedTransition::Cleared(m) => info!(modality = %m, "modality recovered"),
            }
        }

        let mut readings: [Option<Reading>; Modality::COUNT] = Default::default();
        for modality in Modality::ALL {
            let i = modality.index();
            if let Some((sample, stale)) = &tracked.inputs[i] {
                let staleness = if *stale { 0.5 } else { 1.0 };
                let weight = self.weights.get(modality) * health[i].clamp(0.0, 1.0) * staleness;
                readings[i] = Some(Reading {
                    sample: Arc::clone(sample),
                    stale: *stale,
                    weight,
                });
            }
        }

        let present = readings.iter().flatten().count();
        let any_fresh = readings.iter().flatten().any(|r| !r.stale);
        let fusion_confidence = self.confidence(&readings, present, any_fresh);

        let observations: Vec<Observation> = readings
            .iter()
            .flatten()
            .flat_map(|r| {
                r.sample.detections().iter().map(|d| Observation {
                    modality: r.sample.modality,
                    capture_time: r.sample.capture_time,
                    detection: *d,
                    weight: r.weight,
                })
            })
            .collect();
        let clusters = associate(observations, self.association_radius_m, self.association_window);

        let mut outliers = Vec::new();
        let mut total_estimates = 0usize;
        let mut candidates = Vec::with_capacity(clusters.len());
        for (id, cluster) in clusters.iter().enumerate() {
            total_estimates += cluster.members.len() * 2;
            candidates.push(fuse_cluster(id as u32, cluster, &mut outliers));
        }

        let data_consistency = if total_estimates == 0 {
            1.0
        } else {
            1.0 - outliers.len() as f64 / total_estimates as f64
        };
        let sensor_agreement = if candidates.is_empty() {
            if present >= 2 { 1.0 } else { 0.5 }
        } else {
            candidates.iter().map(|c| c.agreement).sum::<f64>() / candidates.len() as f64
        };

        self.update_ego(&readings, frame_time);

        debug!(
            present,
            confidence = fusion_confidence,
            agreement = sensor_agreement,
            obstacles = candidates.len(),
            outliers = outliers.len(),
            "frame fused"
        );

        FusionFrame {
            frame_time,
            readings,
            fusion_confidence,
            sensor_agreement,
            data_consistency,
            outliers,
            candidates,
            ego: self.ego,
            degraded: tracked.degraded,
            transitions: tracked.transitions,
        }
    }

    fn confidence(&self, readings: &[Option<Reading>], present: usize, any_fresh: bool) -> f64 {
        let (weighted, total) = readings
            .iter()
            .flatten()
            .fold((0.0_f64, 0.0_f64), |(q, w), r| {
                (q + r.weight * r.sample.quality, w + r.weight)
            });
        let mut confidence = if total > 0.0 { weighted / total } else { 0.0 };
        if present < self.min_modalities || !any_fresh {
            confidence = confidence.min(DEGRADED_CONFIDENCE_CAP);
        }
        confidence.clamp(0.0, 1.0)
    }

    fn update_ego(&mut self, readings: &[Option<Reading>], frame_time: DateTime<Utc>) {
        if let Some(r) = &readings[Modality::Imu.index()]
            && let NormalizedPayload::Inertial {
                longitudinal_accel_mps2,
                lateral_accel_mps2,
                yaw_rate_rps,
            } = r.sample.payload
        {
            self.ego.yaw_rate_rps = yaw_rate_rps;
            self.ego.longitudinal_accel_mps2 = longitudinal_accel_mps2;
            self.ego.lateral_accel_mps2 = lateral_accel_mps2;
        }

        if let Some(r) = &readings[Modality::Gps.index()]
            && let NormalizedPayload::Pose {
                east_m,
                north_m,
                heading_rad,
                speed_mps,
            } = r.sample.payload
        {
            let dt = ((frame_time - r.sample.capture_time).num_milliseconds().max(0)) as f64 / 1000.0;
            let predicted = heading_rad + self.ego.yaw_rate_rps * dt;
            self.ego.heading_rad = HEADING_ALPHA * predicted + (1.0 - HEADING_ALPHA) * heading_rad;
            self.ego.east_m = east_m;
            self.ego.north_m = north_m;
            self.ego.speed_mps = Some(speed_mps);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Object fusion
// ────────────────────────────────────────────────────────────────────────────

/// Per-modality distance noise (1σ, metres) at `distance_m`.
fn distance_sigma(modality: Modality, distance_m: f64) -> f64 {
    let (base, relative) = match modality {
        Modality::Lidar => (0.05, 0.01),
        Modality::Radar => (0.25, 0.02),
        Modality::Vision => (0.5, 0.05),
        Modality::Gps | Modality::Imu => (1.0, 0.1),
    };
    base + relative * distance_m.abs()
}

/// Per-modality closing-speed noise (1σ, m/s).
fn speed_sigma(modality: Modality) -> f64 {
    match modality {
        Modality::Lidar => 0.3,
        Modality::Radar => 0.1,
        Modality::Vision => 1.0,
        Modality::Gps | Modality::Imu => 1.0,
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Indices of members whose `field` estimate is an outlier.
///
/// Three or more estimates are compared with their median. Two estimates
/// that conflict beyond their combined noise lose the less trusted one.
fn outlying(members: &[Observation], field: EstimateField) -> Vec<(usize, f64)> {
    let value = |o: &Observation| match field {
        EstimateField::Distance => o.detection.distance_m,
        EstimateField::ClosingSpeed => o.detection.closing_speed_mps,
    };
    let sigma = |o: &Observation| match field {
        EstimateField::Distance => distance_sigma(o.modality, o.detection.distance_m),
        EstimateField::ClosingSpeed => speed_sigma(o.modality),
    };

    match members.len() {
        0 | 1 => Vec::new(),
        2 => {
            let (a, b) = (&members[0], &members[1]);
            let combined = sigma(a).hypot(sigma(b));
            if (value(a) - value(b)).abs() <= OUTLIER_SIGMAS * combined {
                return Vec::new();
            }
            let loser = if trust(a) < trust(b) { 0 } else { 1 };
            let reference = value(&members[1 - loser]);
            vec![(loser, reference)]
        }
        _ => {
            let mut values: Vec<f64> = members.iter().map(value).collect();
            let reference = median(&mut values);
            members
                .iter()
                .enumerate()
                .filter(|(_, o)| (value(o) - reference).abs() > OUTLIER_SIGMAS * sigma(o))
                .map(|(i, _)| (i, reference))
                .collect()
        }
    }
}

/// 1 − mean pairwise normalized disagreement; 0.5 for a single estimate.
fn agreement(members: &[Observation]) -> f64 {
    if members.len() < 2 {
        return 0.5;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            let (da, db) = (a.detection.distance_m, b.detection.distance_m);
            let (sa, sb) = (a.detection.closing_speed_mps, b.detection.closing_speed_mps);
            let d_dist = (da - db).abs() / da.max(db).max(1.0);
            let d_speed = (sa - sb).abs() / sa.abs().max(sb.abs()).max(1.0);
            total += ((d_dist + d_speed) / 2.0).min(1.0);
            pairs += 1;
        }
    }
    (1.0 - total / pairs as f64).clamp(0.0, 1.0)
}

/// Exclusion is tracked per field: a member whose closing speed is an outlier
/// still contributes its distance. Every field keeps at least one estimate.
fn fuse_cluster(id: u32, cluster: &Cluster, outliers: &mut Vec<Outlier>) -> ObstacleCandidate {
    let members = &cluster.members;
    let mut excluded_distance = vec![false; members.len()];
    let mut excluded_speed = vec![false; members.len()];

    for field in [EstimateField::Distance, EstimateField::ClosingSpeed] {
        let value = |o: &Observation| match field {
            EstimateField::Distance => o.detection.distance_m,
            EstimateField::ClosingSpeed => o.detection.closing_speed_mps,
        };
        let mut flagged = outlying(members, field);
        if !flagged.is_empty() && flagged.len() == members.len() {
            // Nothing would be left; the estimate nearest the reference stays.
            if let Some(pos) = flagged
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = (value(&members[a.0]) - a.1).abs();
                    let db = (value(&members[b.0]) - b.1).abs();
                    da.total_cmp(&db)
                })
                .map(|(pos, _)| pos)
            {
                flagged.swap_remove(pos);
            }
        }
        let excluded = match field {
            EstimateField::Distance => &mut excluded_distance,
            EstimateField::ClosingSpeed => &mut excluded_speed,
        };
        for (i, reference) in flagged {
            let o = &members[i];
            let value = value(o);
            warn!(
                obstacle_id = id,
                modality = %o.modality,
                ?field,
                value,
                reference,
                "outlier excluded from fused estimate"
            );
            outliers.push(Outlier {
                obstacle_id: id,
                modality: o.modality,
                field,
                value,
                reference,
            });
            excluded[i] = true;
        }
    }

    let for_distance = select(members, |i| !excluded_distance[i]);
    let for_speed = select(members, |i| !excluded_speed[i]);
    let contributing = select(members, |i| !excluded_distance[i] || !excluded_speed[i]);
    let consistent = select(members, |i| !excluded_distance[i] && !excluded_speed[i]);

    let distance_m = weighted_mean(&for_distance, |o| o.detection.distance_m);
    let relative_speed_mps = weighted_mean(&for_speed, |o| o.detection.closing_speed_mps);
    let sin = weighted_mean(&contributing, |o| o.detection.bearing_rad.sin());
    let cos = weighted_mean(&contributing, |o| o.detection.bearing_rad.cos());
    let width_m = contributing
        .iter()
        .map(|o| o.detection.width_m)
        .fold(0.0_f64, f64::max);

    // Members with an excluded estimate leave `detected_by`, unless that
    // would leave no sensor behind the object at all.
    let reporters = if consistent.is_empty() { &contributing } else { &consistent };

    ObstacleCandidate {
        id,
        obstacle_type: vote_type(&contributing),
        distance_m,
        bearing_rad: sin.atan2(cos),
        relative_speed_mps,
        width_m,
        detected_by: reporters.iter().map(|o| o.modality).collect(),
        agreement: agreement(members),
    }
}

fn select(members: &[Observation], keep: impl Fn(usize) -> bool) -> Vec<&Observation> {
    members
        .iter()
        .enumerate()
        .filter(|(i, _)| keep(*i))
        .map(|(_, o)| o)
        .collect()
}

fn trust(o: &Observation) -> f64 {
    (o.weight * o.detection.confidence).max(0.0)
}

/// Trust-weighted mean of `f` over `obs`; plain mean when no one is trusted.
fn weighted_mean(obs: &[&Observation], f: impl Fn(&Observation) -> f64) -> f64 {
    if obs.is_empty() {
        return 0.0;
    }
    let total: f64 = obs.iter().map(|&o| trust(o)).sum();
    if total > 0.0 {
        obs.iter().map(|&o| trust(o) * f(o)).sum::<f64>() / total
    } else {
        obs.iter().map(|&o| f(o)).sum::<f64>() / obs.len() as f64
    }
}

/// Weighted vote; `Unknown` only wins when nothing else was reported.
fn vote_type(voters: &[&Observation]) -> ObstacleType {
    let mut tally: Vec<(ObstacleType, f64)> = Vec::new();
    for o in voters.iter().copied() {
        let t = o.detection.obstacle_type;
        if t == ObstacleType::Unknown {
            continue;
        }
        let w = trust(o).max(f64::EPSILON);
        match tally.iter_mut().find(|(k, _)| *k == t) {
            Some((_, acc)) => *acc += w,
            None => tally.push((t, w)),
        }
    }
    tally
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(t, _)| t)
        .unwrap_or(ObstacleType::Unknown)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_types::Detection;

    const FULL_HEALTH: [f64; Modality::COUNT] = [1.0; Modality::COUNT];

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn detections(
        modality: Modality,
        seq: u64,
        quality: f64,
        dets: &[(ObstacleType, f64, f64)],
    ) -> NormalizedSample {
        NormalizedSample {
            modality,
            sequence_id: seq,
            capture_time: t0(),
            quality,
            payload: NormalizedPayload::Detections {
                detections: dets
                    .iter()
                    .map(|&(obstacle_type, distance_m, closing_speed_mps)| Detection {
                        obstacle_type,
                        distance_m,
                        bearing_rad: 0.0,
                        closing_speed_mps,
                        width_m: 0.6,
                        confidence: 0.9,
                    })
                    .collect(),
            },
        }
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(&PipelineConfig::default())
    }

    #[test]
    fn no_modalities_yields_zero_confidence() {
        let mut e = engine();
        let frame = e.fuse(Vec::new(), &FULL_HEALTH, t0());
        assert_eq!(frame.fusion_confidence, 0.0);
        assert!(frame.candidates.is_empty());
        assert!(frame.is_sensor_loss());
        assert_eq!(frame.sensor_agreement, 0.5);
    }

    #[test]
    fn single_modality_confidence_is_capped() {
        let mut e = engine();
        let frame = e.fuse(
            vec![detections(Modality::Vision, 1, 0.95, &[(ObstacleType::Vehicle, 40.0, 2.0)])],
            &FULL_HEALTH,
            t0(),
        );
        assert!(frame.fusion_confidence <= 0.5);
        assert_eq!(frame.candidates.len(), 1);
        assert_eq!(frame.candidates[0].agreement, 0.5);
        assert!(!frame.candidates[0].is_multi_sensor_detection());
    }

    #[test]
    fn confidence_is_weighted_mean_of_quality() {
        let mut e = engine();
        let frame = e.fuse(
            vec![
                detections(Modality::Lidar, 1, 0.9, &[]),
                detections(Modality::Radar, 1, 0.6, &[]),
            ],
            &FULL_HEALTH,
            t0(),
        );
        // (1.0·0.9 + 0.9·0.6) / 1.9
        let expected = (0.9 + 0.54) / 1.9;
        assert!((frame.fusion_confidence - expected).abs() < 1e-9);
        assert_eq!(frame.sensor_agreement, 1.0);
        assert_eq!(frame.data_consistency, 1.0);
    }

    #[test]
    fn agreeing_modalities_fuse_into_one_candidate() {
        let mut e = engine();
        let frame = e.fuse(
            vec![
                detections(Modality::Lidar, 1, 0.9, &[(ObstacleType::Pedestrian, 8.0, 5.0)]),
                detections(Modality::Radar, 1, 0.9, &[(ObstacleType::Unknown, 8.1, 5.0)]),
            ],
            &FULL_HEALTH,
            t0(),
        );
        assert_eq!(frame.candidates.len(), 1);
        let c = frame.candidates[0];
        assert_eq!(c.obstacle_type, ObstacleType::Pedestrian);
        assert!(c.is_multi_sensor_detection());
        assert!(c.distance_m > 8.0 && c.distance_m < 8.1);
        assert!(c.agreement > 0.9);
        assert!(frame.outliers.is_empty());
    }

    #[test]
    fn conflicting_estimate_is_excluded_as_outlier() {
        let mut e = engine();
        let frame = e.fuse(
            vec![
                detections(Modality::Lidar, 1, 0.9, &[(ObstacleType::Vehicle, 20.0, 3.0)]),
                detections(Modality::Radar, 1, 0.9, &[(ObstacleType::Vehicle, 20.1, 3.0)]),
                // Same place, wildly different closing speed.
                detections(Modality::Vision, 1, 0.9, &[(ObstacleType::Vehicle, 20.2, 15.0)]),
            ],
            &FULL_HEALTH,
            t0(),
        );
        assert_eq!(frame.candidates.len(), 1);
        let c = frame.candidates[0];
        assert!(!c.detected_by.contains(Modality::Vision));
        assert_eq!(c.detected_by.len(), 2);
        assert!((c.relative_speed_mps - 3.0).abs() < 1e-9);
        assert_eq!(frame.outliers.len(), 1);
        assert_eq!(frame.outliers[0].modality, Modality::Vision);
        assert_eq!(frame.outliers[0].field, EstimateField::ClosingSpeed);
        assert!((frame.data_consistency - (1.0 - 1.0 / 6.0)).abs() < 1e-9);
        assert!(c.agreement < 0.9);
    }

    #[test]
    fn object_survives_when_every_sensor_disagrees_on_one_field() {
        let mut e = engine();
        let frame = e.fuse(
            vec![
                // Lidar's range and the others' closing speeds are off.
                detections(Modality::Lidar, 1, 0.9, &[(ObstacleType::Pedestrian, 20.0, 5.0)]),
                detections(Modality::Radar, 1, 0.9, &[(ObstacleType::Pedestrian, 21.0, 8.0)]),
                detections(Modality::Vision, 1, 0.9, &[(ObstacleType::Pedestrian, 21.5, 1.0)]),
            ],
            &FULL_HEALTH,
            t0(),
        );
        assert_eq!(frame.candidates.len(), 1);
        let c = frame.candidates[0];
        assert_eq!(c.obstacle_type, ObstacleType::Pedestrian);
        assert!(c.distance_m >= 21.0 && c.distance_m <= 21.5, "distance {}", c.distance_m);
        assert!((c.relative_speed_mps - 5.0).abs() < 1e-9);
        assert!(!c.detected_by.is_empty());
        assert_eq!(c.detected_by.len(), 3);

        assert_eq!(frame.outliers.len(), 3);
        let distance_outliers: Vec<_> = frame
            .outliers
            .iter()
            .filter(|o| o.field == EstimateField::Distance)
            .map(|o| o.modality)
            .collect();
        assert_eq!(distance_outliers, vec![Modality::Lidar]);
        assert!((frame.data_consistency - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stale_reading_is_reused_then_excluded() {
        let mut e = engine();
        let lidar = detections(Modality::Lidar, 1, 0.9, &[]);
        let radar = |seq| detections(Modality::Radar, seq, 0.9, &[]);

        let f0 = e.fuse(vec![lidar, radar(1)], &FULL_HEALTH, t0());
        assert!(f0.stale().is_empty());

        for cycle in 1..=3 {
            let frame = e.fuse(vec![radar(cycle + 1)], &FULL_HEALTH, t0());
            let r = frame.reading(Modality::Lidar).expect("stale lidar reused");
            assert!(r.stale);
            assert!((r.weight - 0.5).abs() < 1e-9);
            assert!(frame.degraded.is_empty());
        }

        let excluded = e.fuse(vec![radar(5)], &FULL_HEALTH, t0());
        assert!(excluded.reading(Modality::Lidar).is_none());
        assert!(excluded.degraded.contains(Modality::Lidar));
        assert_eq!(
            excluded.transitions,
            vec![DegradedTransition::Entered(Modality::Lidar)]
        );

        let recovered = e.fuse(
            vec![detections(Modality::Lidar, 2, 0.9, &[]), radar(6)],
            &FULL_HEALTH,
            t0(),
        );
        assert!(recovered.degraded.is_empty());
        assert_eq!(
            recovered.transitions,
            vec![DegradedTransition::Cleared(Modality::Lidar)]
        );
    }

    #[test]
    fn total_sensor_loss_caps_confidence() {
        let mut e = engine();
        e.fuse(
            vec![
                detections(Modality::Lidar, 1, 1.0, &[]),
                detections(Modality::Radar, 1, 1.0, &[]),
                detections(Modality::Vision, 1, 1.0, &[]),
            ],
            &FULL_HEALTH,
            t0(),
        );
        let frame = e.fuse(Vec::new(), &FULL_HEALTH, t0());
        assert_eq!(frame.present().len(), 3);
        assert!(frame.is_sensor_loss());
        assert!(frame.fusion_confidence <= 0.5);
    }

    #[test]
    fn health_scales_trust_weight() {
        let mut e = engine();
        let mut health = FULL_HEALTH;
        health[Modality::Radar.index()] = 0.5;
        let frame = e.fuse(vec![detections(Modality::Radar, 1, 0.9, &[])], &health, t0());
        let r = frame.reading(Modality::Radar).unwrap();
        assert!((r.weight - 0.45).abs() < 1e-9);
    }

    #[test]
    fn ego_state_from_gps_and_imu() {
        let mut e = engine();
        let gps = NormalizedSample {
            modality: Modality::Gps,
            sequence_id: 1,
            capture_time: t0(),
            quality: 0.9,
            payload: NormalizedPayload::Pose {
                east_m: 3.0,
                north_m: 4.0,
                heading_rad: 1.0,
                speed_mps: 12.0,
            },
        };
        let imu = NormalizedSample {
            modality: Modality::Imu,
            sequence_id: 1,
            capture_time: t0(),
            quality: 0.9,
            payload: NormalizedPayload::Inertial {
                longitudinal_accel_mps2: -1.0,
                lateral_accel_mps2: 0.2,
                yaw_rate_rps: 0.5,
            },
        };
        let frame = e.fuse(vec![gps, imu], &FULL_HEALTH, t0() + Duration::milliseconds(100));
        assert_eq!(frame.ego.speed_mps, Some(12.0));
        assert!(!frame.ego.is_stationary());
        // 1.0 + 0.98 · 0.5 · 0.1
        assert!((frame.ego.heading_rad - 1.049).abs() < 1e-9);
        assert_eq!(frame.ego.longitudinal_accel_mps2, -1.0);
    }

    #[test]
    fn unknown_ego_speed_is_not_stationary() {
        assert!(!EgoState::default().is_stationary());
    }
}
