//! [`Fleet`] – one Tokio task per vehicle.
//!
//! Vehicles share nothing but the [`EventBus`]. Each task ticks its
//! [`VehiclePipeline`] on a fixed period; ticks that fall behind are skipped
//! rather than queued ([`MissedTickBehavior::Skip`]), so only the newest
//! decision is ever produced. Control commands reach a vehicle over its own
//! `mpsc` channel and are applied between ticks.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use drivecore_middleware::{EventBus, IngestHandle};
use drivecore_types::{
    ActuatorFeedback, DriveError, DrivingContext, PlanningAlgorithm, SensorSample, VehicleId,
    Waypoint,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, info, info_span, warn};

use crate::pipeline::VehiclePipeline;

const CONTROL_CAPACITY: usize = 32;

/// Commands applied to a running vehicle between cycles.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    ResumeAutonomy,
    StartRoute {
        destination: Waypoint,
        algorithm: PlanningAlgorithm,
    },
    PauseRoute,
    ResumeRoute,
    CancelRoute,
    RetryRoute,
    ActuatorFeedback(ActuatorFeedback),
    OperatorStop(String),
    Shutdown,
}

struct VehicleHandle {
    ingest: IngestHandle,
    control: mpsc::Sender<ControlCommand>,
    task: JoinHandle<()>,
}

pub struct Fleet {
    bus: EventBus,
    vehicles: HashMap<VehicleId, VehicleHandle>,
}

impl Fleet {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            vehicles: HashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn vehicle_ids(&self) -> impl Iterator<Item = &VehicleId> {
        self.vehicles.keys()
    }

    /// Start ticking `pipeline` every `period`. Must be called from within a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DriveError::Config`] when the vehicle is already running or the
    /// period is zero.
    pub fn spawn(&mut self, pipeline: VehiclePipeline, period: Duration) -> Result<(), DriveError> {
        if period.is_zero() {
            return Err(DriveError::Config("cycle period must be > 0".into()));
        }
        let vehicle_id = pipeline.vehicle_id().clone();
        if self.vehicles.contains_key(&vehicle_id) {
            return Err(DriveError::Config(format!("vehicle {vehicle_id} is already running")));
        }
        let ingest = pipeline.ingest_handle();
        let (control, rx) = mpsc::channel(CONTROL_CAPACITY);
        let span = info_span!("vehicle_task", vehicle = %vehicle_id);
        let task = tokio::spawn(run_vehicle(pipeline, rx, period).instrument(span));
        info!(vehicle = %vehicle_id, period_ms = period.as_millis() as u64, "vehicle task spawned");
        self.vehicles.insert(
            vehicle_id,
            VehicleHandle {
                ingest,
                control,
                task,
            },
        );
        Ok(())
    }

    /// Route a sample to its vehicle's ingestion slots.
    pub fn push(&self, sample: SensorSample) -> Result<(), DriveError> {
        self.handle(&sample.vehicle_id)?.ingest.push(sample)
    }

    pub fn update_context(&self, vehicle_id: &VehicleId, context: DrivingContext) -> Result<(), DriveError> {
        self.handle(vehicle_id)?.ingest.update_context(context);
        Ok(())
    }

    pub async fn command(&self, vehicle_id: &VehicleId, command: ControlCommand) -> Result<(), DriveError> {
        self.handle(vehicle_id)?
            .control
            .send(command)
            .await
            .map_err(|_| DriveError::Channel(format!("vehicle {vehicle_id} is no longer running")))
    }

    /// Stop every vehicle task and wait for them to finish.
    pub async fn shutdown(self) {
        for (vehicle_id, handle) in self.vehicles {
            if handle.control.send(ControlCommand::Shutdown).await.is_err() {
                warn!(vehicle = %vehicle_id, "vehicle task already stopped");
            }
            if let Err(e) = handle.task.await {
                warn!(vehicle = %vehicle_id, error = %e, "vehicle task panicked");
            }
        }
    }

    fn handle(&self, vehicle_id: &VehicleId) -> Result<&VehicleHandle, DriveError> {
        self.vehicles
            .get(vehicle_id)
            .ok_or_else(|| DriveError::UnknownVehicle(vehicle_id.clone()))
    }
}

async fn run_vehicle(
    mut pipeline: VehiclePipeline,
    mut control: mpsc::Receiver<ControlCommand>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                pipeline.tick(Utc::now());
            }
            command = control.recv() => match command {
                Some(ControlCommand::Shutdown) | None => break,
                Some(command) => apply(&mut pipeline, command),
            },
        }
    }
    info!(vehicle = %pipeline.vehicle_id(), "vehicle task stopped");
}

fn apply(pipeline: &mut VehiclePipeline, command: ControlCommand) {
    let at = Utc::now();
    let applied = match command {
        ControlCommand::ResumeAutonomy => pipeline.resume_autonomy(at),
        ControlCommand::StartRoute {
            destination,
            algorithm,
        } => match pipeline.start_route(destination, algorithm, at) {
            Ok(()) => true,
            Err(e) => {
                warn!(vehicle = %pipeline.vehicle_id(), error = %e, "route not started");
                false
            }
        },
        ControlCommand::PauseRoute => pipeline.pause_route(at),
        ControlCommand::ResumeRoute => pipeline.resume_route(at),
        ControlCommand::CancelRoute => pipeline.cancel_route(at),
        ControlCommand::RetryRoute => pipeline.retry_route(at),
        ControlCommand::ActuatorFeedback(feedback) => pipeline.report_execution(feedback).is_some(),
        ControlCommand::OperatorStop(reason) => {
            pipeline.operator_stop(&reason);
            true
        }
        ControlCommand::Shutdown => true,
    };
    if !applied {
        warn!(vehicle = %pipeline.vehicle_id(), "control command had no effect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecore_middleware::Topic;
    use drivecore_types::{AlertKind, EventPayload, Modality, PipelineConfig, SensorPayload};

    fn pipeline(bus: &EventBus, id: &str) -> VehiclePipeline {
        VehiclePipeline::new(VehicleId::new(id), PipelineConfig::default(), bus.clone()).unwrap()
    }

    fn sample(id: &str) -> SensorSample {
        SensorSample {
            vehicle_id: VehicleId::new(id),
            modality: Modality::Lidar,
            capture_time: Utc::now(),
            payload: SensorPayload::Detections { detections: vec![] },
            quality: 0.9,
        }
    }

    #[tokio::test]
    async fn vehicles_publish_under_their_own_source() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut fleet = Fleet::new(bus.clone());
        let mut av2 = bus.subscribe_source(Topic::Decisions, "av-2::");
        fleet.spawn(pipeline(&bus, "av-1"), Duration::from_millis(10))?;
        fleet.spawn(pipeline(&bus, "av-2"), Duration::from_millis(10))?;
        fleet.push(sample("av-2"))?;

        let event = tokio::time::timeout(Duration::from_secs(2), av2.recv())
            .await?
            .ok_or("bus closed")?;
        match event.payload {
            EventPayload::Cycle(record) => assert_eq!(record.vehicle_id, VehicleId::new("av-2")),
            other => return Err(format!("unexpected payload {other:?}").into()),
        }
        fleet.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_vehicle_is_rejected() {
        let bus = EventBus::default();
        let mut fleet = Fleet::new(bus.clone());
        fleet.spawn(pipeline(&bus, "av-1"), Duration::from_millis(10)).unwrap();

        assert_eq!(
            fleet.push(sample("ghost")),
            Err(DriveError::UnknownVehicle(VehicleId::new("ghost")))
        );
        assert!(
            fleet
                .command(&VehicleId::new("ghost"), ControlCommand::ResumeAutonomy)
                .await
                .is_err()
        );
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_vehicle_is_rejected() {
        let bus = EventBus::default();
        let mut fleet = Fleet::new(bus.clone());
        fleet.spawn(pipeline(&bus, "av-1"), Duration::from_millis(10)).unwrap();
        let err = fleet.spawn(pipeline(&bus, "av-1"), Duration::from_millis(10));
        assert!(matches!(err, Err(DriveError::Config(_))));
        assert_eq!(fleet.vehicle_ids().count(), 1);
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn operator_stop_command_raises_alert() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let mut fleet = Fleet::new(bus.clone());
        let id = VehicleId::new("av-1");
        fleet.spawn(pipeline(&bus, "av-1"), Duration::from_secs(3600))?;
        fleet
            .command(&id, ControlCommand::OperatorStop("ctrl-c".into()))
            .await?;

        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), alerts.recv()).await??;
            if let EventPayload::Alert(alert) = event.payload
                && alert.kind == AlertKind::OperatorStop
            {
                break;
            }
        }
        fleet.shutdown().await;
        Ok(())
    }
}
