//! [`HealthMonitor`] – per-modality sensor health.
//!
//! The pipeline calls [`HealthMonitor::heartbeat`] whenever a modality
//! delivers a fresh sample and [`HealthMonitor::observe`] once at the end of
//! every cycle. Each observation folds into a rolling score:
//!
//! ```text
//! instant = 0.4·quality + 0.3·agreement + 0.3·connectivity − min(0.3, 0.1·new_rejections)
//! score   = 0.3·instant + 0.7·score
//! ```
//!
//! A modality is *degraded* while the fusion input tracker excludes it or its
//! score is below 0.5. [`HealthMonitor::weights`] feeds the scores back into
//! the fusion engine on the next cycle.
//!
//! A modality is connected while its last heartbeat is within
//! `sensor_timeout_ms`. Modalities that never sent a heartbeat are not
//! tracked.

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{
    HealthStatus, Modality, ModalitySet, PipelineConfig, SensorHealth, SensorHealthReport,
    VehicleId,
};
use tracing::{info, warn};

const SMOOTHING: f64 = 0.3;
const DEGRADED_SCORE: f64 = 0.5;
const REJECTION_PENALTY: f64 = 0.1;
const MAX_REJECTION_PENALTY: f64 = 0.3;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What one cycle saw of each modality, indexed by [`Modality::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthObservation {
    pub at: DateTime<Utc>,
    /// Quality of the reading fused this cycle; `None` when absent.
    pub quality: [Option<f64>; Modality::COUNT],
    /// Agreement contribution in `[0, 1]`.
    pub agreement: [f64; Modality::COUNT],
    /// Cumulative normalizer rejection counts.
    pub rejections: [u64; Modality::COUNT],
    /// Modalities the fusion input tracker has excluded.
    pub excluded: ModalitySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    StatusChanged {
        modality: Modality,
        from: HealthStatus,
        to: HealthStatus,
    },
    Degraded(Modality),
    Recovered(Modality),
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SensorEntry {
    last_heartbeat: DateTime<Utc>,
    score: f64,
    status: HealthStatus,
    rejections_seen: u64,
    degraded: bool,
}

impl SensorEntry {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: at,
            score: 1.0,
            status: HealthStatus::Excellent,
            rejections_seen: 0,
            degraded: false,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// HealthMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats and rolling health scores per modality.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use drivecore_kernel::health::HealthMonitor;
/// use drivecore_types::{Modality, PipelineConfig};
///
/// let mut monitor = HealthMonitor::new(&PipelineConfig::default());
/// let now = Utc::now();
/// monitor.heartbeat(Modality::Lidar, now);
///
/// assert!(monitor.is_connected(Modality::Lidar, now));
/// assert!(monitor.check_all(now).is_empty());
/// ```
pub struct HealthMonitor {
    sensors: [Option<SensorEntry>; Modality::COUNT],
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            sensors: [None; Modality::COUNT],
            timeout: Duration::milliseconds(config.sensor_timeout_ms as i64),
        }
    }

    /// Record a heartbeat, registering the modality on first contact.
    pub fn heartbeat(&mut self, modality: Modality, at: DateTime<Utc>) {
        let entry = self.sensors[modality.index()].get_or_insert_with(|| SensorEntry::new(at));
        entry.last_heartbeat = entry.last_heartbeat.max(at);
    }

    pub fn is_connected(&self, modality: Modality, at: DateTime<Utc>) -> bool {
        self.sensors[modality.index()].is_some_and(|e| at - e.last_heartbeat <= self.timeout)
    }

    /// Modalities whose heartbeat deadline has passed.
    pub fn check_all(&self, at: DateTime<Utc>) -> Vec<Modality> {
        Modality::ALL
            .into_iter()
            .filter(|m| self.sensors[m.index()].is_some() && !self.is_connected(*m, at))
            .collect()
    }

    /// Fold one cycle into the rolling scores.
    pub fn observe(&mut self, obs: &HealthObservation) -> Vec<HealthEvent> {
        let mut events = Vec::new();
        for modality in Modality::ALL {
            let i = modality.index();
            let connected = self.is_connected(modality, obs.at);
            let Some(entry) = self.sensors[i].as_mut() else {
                continue;
            };

            let new_rejections = obs.rejections[i].saturating_sub(entry.rejections_seen);
            entry.rejections_seen = entry.rejections_seen.max(obs.rejections[i]);

            let penalty = (REJECTION_PENALTY * new_rejections as f64).min(MAX_REJECTION_PENALTY);
            let instant = (0.4 * obs.quality[i].unwrap_or(0.0).clamp(0.0, 1.0)
                + 0.3 * obs.agreement[i].clamp(0.0, 1.0)
                + 0.3 * if connected { 1.0 } else { 0.0 }
                - penalty)
                .clamp(0.0, 1.0);
            entry.score = SMOOTHING * instant + (1.0 - SMOOTHING) * entry.score;

            let status = HealthStatus::from_score(entry.score);
            if status != entry.status {
                info!(%modality, from = ?entry.status, to = ?status, score = entry.score, "sensor health changed");
                events.push(HealthEvent::StatusChanged {
                    modality,
                    from: entry.status,
                    to: status,
                });
                entry.status = status;
            }

            let degraded = obs.excluded.contains(modality) || entry.score < DEGRADED_SCORE;
            if degraded && !entry.degraded {
                warn!(%modality, score = entry.score, connected, "sensor entered degraded mode");
                events.push(HealthEvent::Degraded(modality));
            } else if !degraded && entry.degraded {
                info!(%modality, score = entry.score, "sensor left degraded mode");
                events.push(HealthEvent::Recovered(modality));
            }
            entry.degraded = degraded;
        }
        events
    }

    /// Trust multipliers for the fusion engine; untracked modalities get 1.0.
    pub fn weights(&self) -> [f64; Modality::COUNT] {
        std::array::from_fn(|i| self.sensors[i].map_or(1.0, |e| e.score))
    }

    pub fn health(&self, modality: Modality, at: DateTime<Utc>) -> Option<SensorHealth> {
        let entry = self.sensors[modality.index()]?;
        Some(SensorHealth {
            modality,
            score: entry.score,
            status: entry.status,
            connected: self.is_connected(modality, at),
            rejections: entry.rejections_seen,
            degraded: entry.degraded,
        })
    }

    pub fn degraded(&self) -> ModalitySet {
        Modality::ALL
            .into_iter()
            .filter(|m| self.sensors[m.index()].is_some_and(|e| e.degraded))
            .collect()
    }

    pub fn report(&self, vehicle_id: &VehicleId, at: DateTime<Utc>) -> SensorHealthReport {
        SensorHealthReport {
            vehicle_id: vehicle_id.clone(),
            at,
            sensors: Modality::ALL
                .into_iter()
                .filter_map(|m| self.health(m, at))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn ms(n: i64) -> Duration {
        Duration::milliseconds(n)
    }

    fn observation(at: DateTime<Utc>, quality: Option<f64>) -> HealthObservation {
        HealthObservation {
            at,
            quality: [quality; Modality::COUNT],
            agreement: [1.0; Modality::COUNT],
            rejections: [0; Modality::COUNT],
            excluded: ModalitySet::empty(),
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(&PipelineConfig::default())
    }

    #[test]
    fn unknown_modality_is_untracked() {
        let m = monitor();
        assert!(!m.is_connected(Modality::Radar, t0()));
        assert!(m.health(Modality::Radar, t0()).is_none());
        assert!(m.check_all(t0()).is_empty());
        assert_eq!(m.weights(), [1.0; Modality::COUNT]);
    }

    #[test]
    fn silent_modality_times_out() {
        let mut m = monitor();
        m.heartbeat(Modality::Lidar, t0());
        m.heartbeat(Modality::Radar, t0());
        m.heartbeat(Modality::Radar, t0() + ms(400));
        assert_eq!(m.check_all(t0() + ms(600)), vec![Modality::Lidar]);
        assert!(m.is_connected(Modality::Radar, t0() + ms(600)));
    }

    #[test]
    fn healthy_sensor_stays_excellent() {
        let mut m = monitor();
        m.heartbeat(Modality::Lidar, t0());
        for k in 1..=20 {
            let at = t0() + ms(100 * k);
            m.heartbeat(Modality::Lidar, at);
            assert!(m.observe(&observation(at, Some(1.0))).is_empty());
        }
        let h = m.health(Modality::Lidar, t0() + ms(2000)).unwrap();
        assert_eq!(h.status, HealthStatus::Excellent);
        assert!(!h.degraded);
    }

    #[test]
    fn disconnected_sensor_degrades_and_recovers() {
        let mut m = monitor();
        m.heartbeat(Modality::Vision, t0());
        let mut degraded_at = None;
        for k in 1..=20 {
            let events = m.observe(&observation(t0() + ms(1000 * k), None));
            if events.contains(&HealthEvent::Degraded(Modality::Vision)) {
                degraded_at = Some(k);
                break;
            }
        }
        assert!(degraded_at.is_some());
        assert!(m.weights()[Modality::Vision.index()] < DEGRADED_SCORE);
        assert!(m.degraded().contains(Modality::Vision));

        let mut recovered = false;
        for k in 30..60 {
            let at = t0() + ms(100 * k);
            m.heartbeat(Modality::Vision, at);
            if m.observe(&observation(at, Some(1.0))).contains(&HealthEvent::Recovered(Modality::Vision)) {
                recovered = true;
                break;
            }
        }
        assert!(recovered);
    }

    #[test]
    fn exclusion_degrades_immediately() {
        let mut m = monitor();
        m.heartbeat(Modality::Radar, t0());
        let mut obs = observation(t0(), Some(1.0));
        obs.excluded.insert(Modality::Radar);
        assert_eq!(m.observe(&obs), vec![HealthEvent::Degraded(Modality::Radar)]);
        // No repeat while it stays excluded.
        assert!(m.observe(&obs).is_empty());
    }

    #[test]
    fn only_new_rejections_are_penalised() {
        let mut m = monitor();
        m.heartbeat(Modality::Gps, t0());
        let mut obs = observation(t0(), Some(1.0));
        obs.rejections[Modality::Gps.index()] = 5;
        m.observe(&obs);
        let after_burst = m.weights()[Modality::Gps.index()];
        assert!((after_burst - 0.91).abs() < 1e-9);

        m.observe(&obs);
        assert!(m.weights()[Modality::Gps.index()] > after_burst);
        assert_eq!(m.health(Modality::Gps, t0()).unwrap().rejections, 5);
    }

    #[test]
    fn report_lists_tracked_sensors() {
        let mut m = monitor();
        m.heartbeat(Modality::Lidar, t0());
        m.heartbeat(Modality::Imu, t0());
        let report = m.report(&VehicleId::new("av-1"), t0());
        let modalities: Vec<_> = report.sensors.iter().map(|s| s.modality).collect();
        assert_eq!(modalities, vec![Modality::Lidar, Modality::Imu]);
        assert!(report.sensors.iter().all(|s| s.connected));
    }
}
