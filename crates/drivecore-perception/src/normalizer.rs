//! Sensor Normalizer.
//!
//! Validates raw [`SensorSample`]s, converts their payloads to SI units and
//! stamps each accepted sample with a per-modality sequence number.
//!
//! A sample is rejected, never propagated as an error, when:
//!
//! | Reason | Condition |
//! |---|---|
//! | [`StaleKind::OutOfOrder`] | `capture_time` ≤ last accepted capture time of its modality |
//! | [`StaleKind::Expired`] | `now − capture_time` > staleness bound |
//! | [`RejectReason::Malformed`] | wrong payload for the modality, quality outside `[0, 1]`, non-finite or negative geometry, out-of-range coordinates, capture time too far in the future |
//!
//! Because duplicates are rejected as out of order, feeding the same sample
//! twice is a no-op for everything downstream.
//!
//! Gps fixes are projected to a local east/north frame (equirectangular)
//! anchored at the first accepted fix of the stream.

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{
    Detection, Modality, NormalizedPayload, NormalizedSample, RawDetection, SensorPayload,
    SensorSample,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Mean Earth radius used by the local projection (metres).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Why a stale sample was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleKind {
    OutOfOrder,
    Expired,
}

/// Per-sample rejection. Counted, logged, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("stale {modality} sample ({kind:?})")]
    StaleSample { modality: Modality, kind: StaleKind },

    #[error("malformed {modality} sample: {reason}")]
    Malformed { modality: Modality, reason: String },
}

impl RejectReason {
    pub fn modality(&self) -> Modality {
        match self {
            RejectReason::StaleSample { modality, .. } | RejectReason::Malformed { modality, .. } => {
                *modality
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GeoOrigin {
    lat_rad: f64,
    lon_rad: f64,
}

#[derive(Debug, Default)]
struct StreamState {
    last_capture: Option<DateTime<Utc>>,
    last_sequence: u64,
    rejections: u64,
}

/// Stateful per-vehicle normalizer; one stream state per modality.
#[derive(Debug)]
pub struct SensorNormalizer {
    staleness_bound: Duration,
    streams: [StreamState; Modality::COUNT],
    origin: Option<GeoOrigin>,
}

impl SensorNormalizer {
    pub fn new(staleness_bound_ms: u64) -> Self {
        Self {
            staleness_bound: Duration::milliseconds(staleness_bound_ms as i64),
            streams: Default::default(),
            origin: None,
        }
    }

    /// Validate and convert one sample.
    pub fn normalize(
        &mut self,
        sample: SensorSample,
        now: DateTime<Utc>,
    ) -> Result<NormalizedSample, RejectReason> {
        let modality = sample.modality;
        match self.check(&sample, now) {
            Ok(()) => {}
            Err(reason) => {
                self.streams[modality.index()].rejections += 1;
                warn!(%modality, %reason, "sample rejected");
                return Err(reason);
            }
        }

        let payload = match self.convert(modality, sample.payload) {
            Ok(p) => p,
            Err(reason) => {
                self.streams[modality.index()].rejections += 1;
                warn!(%modality, %reason, "sample rejected");
                return Err(reason);
            }
        };

        let stream = &mut self.streams[modality.index()];
        stream.last_capture = Some(sample.capture_time);
        stream.last_sequence += 1;
        debug!(%modality, sequence_id = stream.last_sequence, "sample accepted");

        Ok(NormalizedSample {
            modality,
            sequence_id: stream.last_sequence,
            capture_time: sample.capture_time,
            quality: sample.quality,
            payload,
        })
    }

    /// Total rejections for `modality` since construction.
    pub fn rejection_count(&self, modality: Modality) -> u64 {
        self.streams[modality.index()].rejections
    }

    /// Rejection counters indexed by [`Modality::index`].
    pub fn rejection_counts(&self) -> [u64; Modality::COUNT] {
        let mut out = [0; Modality::COUNT];
        for m in Modality::ALL {
            out[m.index()] = self.rejection_count(m);
        }
        out
    }

    // ────────────────────────────────────────────────────────────────────────
    // Validation
    // ────────────────────────────────────────────────────────────────────────

    fn check(&self, sample: &SensorSample, now: DateTime<Utc>) -> Result<(), RejectReason> {
        let modality = sample.modality;
        let malformed = |reason: &str| RejectReason::Malformed {
            modality,
            reason: reason.to_string(),
        };

        if !(sample.quality.is_finite() && (0.0..=1.0).contains(&sample.quality)) {
            return Err(malformed("quality outside [0, 1]"));
        }
        let payload_matches = match &sample.payload {
            SensorPayload::Detections { .. } => modality.detects_objects(),
            SensorPayload::Fix { .. } => modality == Modality::Gps,
            SensorPayload::Inertial { .. } => modality == Modality::Imu,
        };
        if !payload_matches {
            return Err(malformed("payload does not match modality"));
        }
        if sample.capture_time - now > self.staleness_bound {
            return Err(malformed("capture time in the future"));
        }

        let stream = &self.streams[modality.index()];
        if stream
            .last_capture
            .is_some_and(|last| sample.capture_time <= last)
        {
            return Err(RejectReason::StaleSample {
                modality,
                kind: StaleKind::OutOfOrder,
            });
        }
        if now - sample.capture_time > self.staleness_bound {
            return Err(RejectReason::StaleSample {
                modality,
                kind: StaleKind::Expired,
            });
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Conversion
    // ────────────────────────────────────────────────────────────────────────

    fn convert(
        &mut self,
        modality: Modality,
        payload: SensorPayload,
    ) -> Result<NormalizedPayload, RejectReason> {
        let malformed = |reason: String| RejectReason::Malformed { modality, reason };

        match payload {
            SensorPayload::Detections { detections } => {
                let detections = detections
                    .into_iter()
                    .map(convert_detection)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(malformed)?;
                Ok(NormalizedPayload::Detections { detections })
            }
            SensorPayload::Fix {
                latitude_deg,
                longitude_deg,
                heading,
                speed,
            } => {
                if !(latitude_deg.is_finite() && (-90.0..=90.0).contains(&latitude_deg)) {
                    return Err(malformed(format!("latitude {latitude_deg} out of range")));
                }
                if !(longitude_deg.is_finite() && (-180.0..=180.0).contains(&longitude_deg)) {
                    return Err(malformed(format!("longitude {longitude_deg} out of range")));
                }
                let heading_rad = heading.to_radians();
                let speed_mps = speed.to_mps();
                if !heading_rad.is_finite() || !speed_mps.is_finite() {
                    return Err(malformed("non-finite heading or speed".into()));
                }

                let lat_rad = latitude_deg.to_radians();
                let lon_rad = longitude_deg.to_radians();
                let origin = *self.origin.get_or_insert(GeoOrigin { lat_rad, lon_rad });
                let east_m = (lon_rad - origin.lon_rad) * origin.lat_rad.cos() * EARTH_RADIUS_M;
                let north_m = (lat_rad - origin.lat_rad) * EARTH_RADIUS_M;

                Ok(NormalizedPayload::Pose {
                    east_m,
                    north_m,
                    heading_rad,
                    speed_mps,
                })
            }
            SensorPayload::Inertial {
                longitudinal_accel_mps2,
                lateral_accel_mps2,
                yaw_rate,
            } => {
                let yaw_rate_rps = yaw_rate.to_radians();
                if ![longitudinal_accel_mps2, lateral_accel_mps2, yaw_rate_rps]
                    .iter()
                    .all(|v| v.is_finite())
                {
                    return Err(malformed("non-finite inertial value".into()));
                }
                Ok(NormalizedPayload::Inertial {
                    longitudinal_accel_mps2,
                    lateral_accel_mps2,
                    yaw_rate_rps,
                })
            }
        }
    }
}

fn convert_detection(raw: RawDetection) -> Result<Detection, String> {
    let distance_m = raw.range.to_meters();
    let width_m = raw.width.to_meters();
    let bearing_rad = raw.bearing.to_radians();
    let closing_speed_mps = raw.closing_speed.to_mps();

    if !(distance_m.is_finite() && distance_m >= 0.0) {
        return Err(format!("invalid distance {distance_m}"));
    }
    if !(width_m.is_finite() && width_m >= 0.0) {
        return Err(format!("invalid width {width_m}"));
    }
    if !bearing_rad.is_finite() || !closing_speed_mps.is_finite() {
        return Err("non-finite bearing or speed".into());
    }
    if !(raw.confidence.is_finite() && (0.0..=1.0).contains(&raw.confidence)) {
        return Err("detection confidence outside [0, 1]".into());
    }

    Ok(Detection {
        obstacle_type: raw.obstacle_type,
        distance_m,
        bearing_rad,
        closing_speed_mps,
        width_m,
        confidence: raw.confidence,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
