//! Spatial association of detections across modalities.
//!
//! Detections are projected into the vehicle frame (x forward, y left) and
//! greedily clustered: each detection, most confident first, joins the
//! nearest cluster whose centroid lies within the association radius, that
//! has no member from the same modality yet, and whose first member was
//! captured within the association window. Otherwise it seeds a new cluster.

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{Detection, Modality};

/// One detection tagged with where it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub modality: Modality,
    pub capture_time: DateTime<Utc>,
    pub detection: Detection,
    /// Trust weight of the reading that carried the detection.
    pub weight: f64,
}

impl Observation {
    /// Vehicle-frame position (x forward, y left).
    pub fn position(&self) -> (f64, f64) {
        let d = &self.detection;
        (d.distance_m * d.bearing_rad.cos(), d.distance_m * d.bearing_rad.sin())
    }
}

/// Observations believed to describe the same physical object.
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    pub members: Vec<Observation>,
    centroid: (f64, f64),
}

impl Cluster {
    fn seed(obs: Observation) -> Self {
        Self {
            centroid: obs.position(),
            members: vec![obs],
        }
    }

    fn push(&mut self, obs: Observation) {
        self.members.push(obs);
        let n = self.members.len() as f64;
        let (sx, sy) = self
            .members
            .iter()
            .map(Observation::position)
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        self.centroid = (sx / n, sy / n);
    }

    pub fn centroid(&self) -> (f64, f64) {
        self.centroid
    }

    fn has_modality(&self, modality: Modality) -> bool {
        self.members.iter().any(|m| m.modality == modality)
    }
}

/// Cluster `observations` within `radius_m` and `window`.
///
/// The output order is deterministic for a given input set.
pub fn associate(mut observations: Vec<Observation>, radius_m: f64, window: Duration) -> Vec<Cluster> {
    observations.sort_by(|a, b| {
        b.detection
            .confidence
            .total_cmp(&a.detection.confidence)
            .then(a.modality.cmp(&b.modality))
            .then(a.detection.distance_m.total_cmp(&b.detection.distance_m))
    });

    let mut clusters: Vec<Cluster> = Vec::new();
    for obs in observations {
        let (x, y) = obs.position();
        let best = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.has_modality(obs.modality))
            .filter(|(_, c)| (c.members[0].capture_time - obs.capture_time).abs() <= window)
            .map(|(i, c)| {
                let (cx, cy) = c.centroid;
                (i, (x - cx).hypot(y - cy))
            })
            .filter(|(_, dist)| *dist <= radius_m)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((i, _)) => clusters[i].push(obs),
            None => clusters.push(Cluster::seed(obs)),
        }
    }
    clusters
}
