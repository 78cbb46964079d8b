//! Deterministic scenario replay.
//!
//! A scenario is a JSON document listing, cycle by cycle, the samples each
//! modality delivers. Cycle times are derived from `start` and `cycle_ms`,
//! never from the wall clock, so a replay always produces the same records.
//!
//! ```json
//! {
//!   "vehicle_id": "av-1",
//!   "start": "2024-05-01T12:00:00Z",
//!   "cycle_ms": 100,
//!   "route": { "destination": { "east_m": 200.0, "north_m": 0.0 }, "algorithm": "a_star" },
//!   "cycles": [
//!     { "samples": [ { "modality": "lidar", "quality": 0.9,
//!                      "payload": { "kind": "detections", "detections": [] } } ] },
//!     { "resume_autonomy": true }
//!   ]
//! }
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use drivecore_middleware::{EventBus, Topic, TopicReceiver};
use drivecore_runtime::VehiclePipeline;
use drivecore_types::{
    ActuatorFeedback, Alert, CycleRecord, DriveError, DrivingContext, EventPayload, Modality,
    PipelineConfig, PlanningAlgorithm, SensorPayload, SensorSample, VehicleId, Waypoint,
};
use serde::Deserialize;
use tracing::info;

fn default_cycle_ms() -> i64 {
    100
}

fn default_start() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Falls back to the configured vehicle id.
    #[serde(default)]
    pub vehicle_id: Option<VehicleId>,
    #[serde(default = "default_start")]
    pub start: DateTime<Utc>,
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: i64,
    /// Overrides the configured pipeline settings.
    #[serde(default)]
    pub config: Option<PipelineConfig>,
    #[serde(default)]
    pub context: Option<DrivingContext>,
    #[serde(default)]
    pub route: Option<RouteSpec>,
    pub cycles: Vec<ScenarioCycle>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub destination: Waypoint,
    pub algorithm: PlanningAlgorithm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioCycle {
    pub samples: Vec<ScenarioSample>,
    /// Replaces the driving context from this cycle on.
    pub context: Option<DrivingContext>,
    /// Applied before the cycle runs.
    pub resume_autonomy: bool,
    /// Reported after the cycle runs, stamped `feedback_after_ms` later.
    pub feedback: Option<ScenarioFeedback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSample {
    pub modality: Modality,
    pub payload: SensorPayload,
    pub quality: f64,
    /// Capture time relative to the cycle time (negative = earlier).
    #[serde(default)]
    pub offset_ms: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScenarioFeedback {
    pub executed_successfully: bool,
    pub collision_avoided: bool,
    #[serde(default)]
    pub path_deviation_m: f64,
    #[serde(default)]
    pub feedback_after_ms: i64,
}

/// Records and alerts produced by a replay.
#[derive(Debug, Default)]
pub struct ReplayOutput {
    pub records: Vec<CycleRecord>,
    pub alerts: Vec<Alert>,
    /// The replay stopped early on an operator stop.
    pub interrupted: bool,
}

pub fn load(path: &Path) -> Result<Scenario, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read scenario at {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| format!("Failed to parse scenario: {}", e))
}

/// Run `scenario` through a fresh pipeline publishing on `bus`.
///
/// Stops before the next cycle once `stop` is set.
pub fn run(
    scenario: &Scenario,
    fallback_vehicle: &VehicleId,
    fallback_config: &PipelineConfig,
    bus: &EventBus,
    stop: &Arc<AtomicBool>,
) -> Result<ReplayOutput, DriveError> {
    if scenario.cycle_ms <= 0 {
        return Err(DriveError::Config("cycle_ms must be > 0".into()));
    }
    let vehicle_id = scenario
        .vehicle_id
        .clone()
        .unwrap_or_else(|| fallback_vehicle.clone());
    let config = scenario.config.clone().unwrap_or_else(|| fallback_config.clone());

    let mut alert_rx = bus.subscribe_to(Topic::Alerts);
    let mut pipeline = VehiclePipeline::new(vehicle_id.clone(), config, bus.clone())?;
    let ingest = pipeline.ingest_handle();
    if let Some(context) = scenario.context {
        ingest.update_context(context);
    }
    if let Some(route) = &scenario.route {
        pipeline.start_route(route.destination, route.algorithm, scenario.start)?;
    }

    let mut output = ReplayOutput::default();
    for (i, cycle) in scenario.cycles.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            info!(cycle = i + 1, "replay interrupted");
            pipeline.operator_stop("replay interrupted");
            output.interrupted = true;
            break;
        }
        let at = scenario.start + Duration::milliseconds(scenario.cycle_ms * i as i64);

        if let Some(context) = cycle.context {
            ingest.update_context(context);
        }
        if cycle.resume_autonomy {
            pipeline.resume_autonomy(at);
        }
        for sample in &cycle.samples {
            ingest.push(SensorSample {
                vehicle_id: vehicle_id.clone(),
                modality: sample.modality,
                capture_time: at + Duration::milliseconds(sample.offset_ms),
                payload: sample.payload.clone(),
                quality: sample.quality,
            })?;
        }

        output.records.push(pipeline.tick(at));

        if let Some(feedback) = cycle.feedback {
            pipeline.report_execution(ActuatorFeedback {
                executed_successfully: feedback.executed_successfully,
                collision_avoided: feedback.collision_avoided,
                path_deviation_m: feedback.path_deviation_m,
                executed_at: at + Duration::milliseconds(feedback.feedback_after_ms),
            });
        }
    }
    output.alerts = drain_alerts(&mut alert_rx);
    Ok(output)
}

fn drain_alerts(rx: &mut TopicReceiver) -> Vec<Alert> {
    let mut alerts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EventPayload::Alert(alert) = event.payload {
            alerts.push(alert);
        }
    }
    alerts
}
