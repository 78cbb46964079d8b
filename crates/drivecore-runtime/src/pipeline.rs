//! [`VehiclePipeline`] – one vehicle's perception-to-action cycle.
//!
//! Each call to [`VehiclePipeline::tick`] runs the stages in order:
//!
//! 1. **Normalize** – take the latest sample of every modality from the
//!    ingestion slots and validate it. Accepted samples count as heartbeats
//!    for the [`HealthMonitor`].
//! 2. **Fuse** – build a [`FusionFrame`] weighted by the previous cycle's
//!    health scores.
//! 3. **Score** – assess every fused obstacle against the current driving
//!    context.
//! 4. **Decide** – step the [`DecisionStateMachine`]. Exactly one decision
//!    per cycle.
//! 5. **Avoid & plan** – run the [`AvoidancePlanner`] and the
//!    [`PathPlannerCoordinator`]. Skipped when the cycle budget is already
//!    spent; the previous outputs are then repeated and the record is marked
//!    `degraded_output`.
//! 6. **Report** – fold the cycle into the health monitor, raise alerts and
//!    publish the [`CycleRecord`] and health report on the [`EventBus`].
//!
//! The cycle's wall-clock duration is finally checked by the
//! [`OverrunGuard`]. Repeated hard-deadline overruns raise a hard-fault alert
//! and force HumanTakeover on the next cycle.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use drivecore_middleware::{EventBus, Topic};
//! use drivecore_runtime::VehiclePipeline;
//! use drivecore_types::{PipelineConfig, VehicleId};
//!
//! let bus = EventBus::default();
//! let mut decisions = bus.subscribe_to(Topic::Decisions);
//! let mut pipeline =
//!     VehiclePipeline::new(VehicleId::new("av-1"), PipelineConfig::default(), bus).unwrap();
//!
//! let record = pipeline.tick(Utc::now());
//! assert_eq!(record.cycle, 1);
//! assert!(decisions.try_recv().is_ok());
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use drivecore_kernel::{
    AvoidanceInput, AvoidancePlanner, DecisionInput, DecisionStateMachine, HealthEvent,
    HealthMonitor, HealthObservation,
};
use drivecore_middleware::{EventBus, IngestHandle, SlotReader, Topic, ingest_slots};
use drivecore_perception::{FusionEngine, FusionFrame, RiskScorer, SensorNormalizer};
use drivecore_planner::{PathPlannerCoordinator, PlannerInput, RoutingStrategy};
use drivecore_types::{
    ActuatorFeedback, Alert, AlertKind, AvoidanceRecord, CycleRecord, DriveError, DriveState,
    Event, EventPayload, Modality, PipelineConfig, PlanningAlgorithm, RouteState, RouteStatus,
    SensorHealthReport, VehicleId, Waypoint,
};
use tracing::{debug, error, info, instrument, warn};

use crate::overrun_guard::OverrunGuard;

// ─────────────────────────────────────────────────────────────────────────────
// Cycle timing
// ─────────────────────────────────────────────────────────────────────────────

/// Measures how much of the cycle budget has been spent.
pub trait CycleTimer: Send {
    /// Called once at the start of every cycle.
    fn start(&mut self);
    /// Time since the last [`start`](CycleTimer::start).
    fn elapsed(&self) -> Duration;
}

/// Wall-clock timer backed by [`Instant`].
#[derive(Debug, Default)]
pub struct WallTimer {
    started: Option<Instant>,
}

impl CycleTimer for WallTimer {
    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VehiclePipeline
// ─────────────────────────────────────────────────────────────────────────────

pub struct VehiclePipeline {
    vehicle_id: VehicleId,
    /// Event source tag, `"<vehicle>::pipeline"`.
    source: String,
    budget: Duration,
    ingest: IngestHandle,
    reader: SlotReader,
    bus: EventBus,
    normalizer: SensorNormalizer,
    fusion: FusionEngine,
    scorer: RiskScorer,
    decisions: DecisionStateMachine,
    avoidance: AvoidancePlanner,
    planner: PathPlannerCoordinator,
    health: HealthMonitor,
    overruns: OverrunGuard,
    timer: Box<dyn CycleTimer>,
    cycle: u64,
    // ── Outputs repeated when the budget runs out ─────────────────────────────
    last_avoidance: Option<AvoidanceRecord>,
    last_route: Arc<RouteState>,
    /// Set when the overrun guard trips; consumed by the next decision step.
    hard_fault: bool,
}

impl VehiclePipeline {
    /// Build a pipeline for `vehicle_id` publishing on `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::Config`] when `config` fails validation.
    pub fn new(vehicle_id: VehicleId, config: PipelineConfig, bus: EventBus) -> Result<Self, DriveError> {
        config.validate()?;
        let (ingest, reader) = ingest_slots(vehicle_id.clone());
        let planner = PathPlannerCoordinator::new(&config);
        let last_route = planner.snapshot();
        info!(vehicle = %vehicle_id, budget_ms = config.cycle_budget_ms, "vehicle pipeline created");
        Ok(Self {
            source: format!("{vehicle_id}::pipeline"),
            vehicle_id,
            budget: Duration::from_millis(config.cycle_budget_ms),
            ingest,
            reader,
            bus,
            normalizer: SensorNormalizer::new(config.staleness_bound_ms),
            fusion: FusionEngine::new(&config),
            scorer: RiskScorer::new(&config),
            decisions: DecisionStateMachine::new(&config),
            avoidance: AvoidancePlanner::new(&config),
            planner,
            health: HealthMonitor::new(&config),
            overruns: OverrunGuard::from_config(&config),
            timer: Box::new(WallTimer::default()),
            cycle: 0,
            last_avoidance: None,
            last_route,
            hard_fault: false,
        })
    }

    /// Replace the wall-clock cycle timer.
    pub fn with_timer(mut self, timer: impl CycleTimer + 'static) -> Self {
        self.timer = Box::new(timer);
        self
    }

    /// Register (or replace) a routing strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn RoutingStrategy>) -> Self {
        self.planner = self.planner.with_strategy(strategy);
        self
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.vehicle_id
    }

    /// Producer handle for this vehicle's ingestion slots.
    pub fn ingest_handle(&self) -> IngestHandle {
        self.ingest.clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> DriveState {
        self.decisions.state()
    }

    pub fn route(&self) -> Arc<RouteState> {
        self.planner.snapshot()
    }

    pub fn health_report(&self, at: DateTime<Utc>) -> SensorHealthReport {
        self.health.report(&self.vehicle_id, at)
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run one full cycle at `now`. Always yields a record.
    #[instrument(skip(self, now), fields(vehicle = %self.vehicle_id, cycle = self.cycle + 1))]
    pub fn tick(&mut self, now: DateTime<Utc>) -> CycleRecord {
        self.timer.start();
        self.cycle += 1;
        let context = self.reader.context();
        let route_status_before = self.planner.status();
        let pending_maneuver = self.planner.pending_maneuver();

        // ── 1. Normalize ──────────────────────────────────────────────────────
        let mut fresh = Vec::new();
        for sample in self.reader.take_fresh() {
            if let Ok(normalized) = self.normalizer.normalize(sample, now) {
                self.health.heartbeat(normalized.modality, now);
                fresh.push(normalized);
            }
        }

        // ── 2. Fuse ───────────────────────────────────────────────────────────
        let frame = self.fusion.fuse(fresh, &self.health.weights(), now);

        // ── 3. Score ──────────────────────────────────────────────────────────
        let risk = self.scorer.score_frame(&frame.candidates, &context.environment);
        let threat = risk.most_threatening();
        debug!(
            obstacles = risk.obstacles.len(),
            severity = ?risk.aggregate.severity,
            ttc = ?risk.aggregate.time_to_collision,
            "frame scored"
        );

        // ── 4. Decide ─────────────────────────────────────────────────────────
        let sensor_loss = frame.is_sensor_loss();
        let outcome = self.decisions.step(&DecisionInput {
            at: now,
            fusion_confidence: frame.fusion_confidence,
            sensor_loss,
            hard_fault: self.hard_fault,
            aggregate: risk.aggregate,
            threat: threat.map(|s| &s.candidate),
            ego_stationary: frame.ego.is_stationary(),
            lanes: &context.lanes,
            pending_maneuver,
        });
        self.hard_fault = false;

        // ── 5. Avoid & plan ───────────────────────────────────────────────────
        let spent = self.timer.elapsed();
        let degraded_output = spent >= self.budget;
        let (avoidance, route) = if degraded_output {
            warn!(
                spent_ms = spent.as_millis() as u64,
                "cycle budget exhausted, repeating last avoidance and route"
            );
            (self.last_avoidance, Arc::clone(&self.last_route))
        } else {
            let avoidance = self.avoidance.plan(&AvoidanceInput {
                at: now,
                decision: &outcome.decision,
                threat: threat.map(|s| (&s.candidate, &s.risk)),
                context: &context,
                ego_speed_mps: frame.ego.speed_mps.unwrap_or(0.0),
            });
            let route = self.planner.tick(&PlannerInput {
                at: now,
                decision: &outcome.decision,
                obstacles: &frame.candidates,
                ego: ego_pose(&frame),
                environmental_risk: risk.aggregate.environmental_risk,
                avoidance: avoidance.as_ref(),
            });
            self.last_avoidance = avoidance;
            self.last_route = Arc::clone(&route);
            (avoidance, route)
        };

        // ── 6. Report ─────────────────────────────────────────────────────────
        let observation = HealthObservation {
            at: now,
            quality: std::array::from_fn(|i| {
                frame.readings[i]
                    .as_ref()
                    .filter(|r| !r.stale)
                    .map(|r| r.sample.quality)
            }),
            agreement: Modality::ALL.map(|m| frame.agreement_of(m)),
            rejections: self.normalizer.rejection_counts(),
            excluded: frame.degraded,
        };
        for event in self.health.observe(&observation) {
            match event {
                HealthEvent::Degraded(modality) => self.alert(
                    AlertKind::DegradedModeEntered { modality },
                    format!("{modality} entered degraded mode"),
                ),
                HealthEvent::Recovered(modality) => self.alert(
                    AlertKind::DegradedModeCleared { modality },
                    format!("{modality} left degraded mode"),
                ),
                HealthEvent::StatusChanged { .. } => {}
            }
        }

        if outcome.transitioned() && outcome.state == DriveState::HumanTakeover {
            let message = if sensor_loss {
                "all sensor modalities lost, human takeover required"
            } else {
                "human takeover required"
            };
            self.alert(AlertKind::HumanTakeover, message);
            if sensor_loss {
                self.alert(AlertKind::HardFault, "loss of all sensor modalities");
            }
        }
        if route.status == RouteStatus::HumanInterventionRequired
            && route_status_before != RouteStatus::HumanInterventionRequired
        {
            self.alert(
                AlertKind::HumanInterventionRequired,
                "route held for human intervention",
            );
        }

        let record = CycleRecord {
            vehicle_id: self.vehicle_id.clone(),
            cycle: self.cycle,
            cycle_time: now,
            state: outcome.state,
            decision: outcome.decision,
            avoidance,
            route: (*route).clone(),
            fusion: frame.summary(risk.aggregate),
            degraded_output,
        };
        debug!(
            decision = ?record.decision.kind,
            state = ?record.state,
            route = ?record.route.status,
            confidence = frame.fusion_confidence,
            "cycle complete"
        );
        self.publish(Topic::Decisions, EventPayload::Cycle(Box::new(record.clone())));
        self.publish(
            Topic::Telemetry,
            EventPayload::Health(self.health.report(&self.vehicle_id, now)),
        );

        // ── Overrun check ─────────────────────────────────────────────────────
        let elapsed = self.timer.elapsed();
        if self.overruns.record(elapsed) {
            let consecutive = self.overruns.consecutive();
            error!(
                elapsed_ms = elapsed.as_millis() as u64,
                consecutive, "hard deadline overrun, forcing human takeover"
            );
            let fault = DriveError::HardFault {
                vehicle: self.vehicle_id.clone(),
                details: format!("{consecutive} consecutive cycles past the hard deadline"),
            };
            self.alert(AlertKind::HardFault, fault.to_string());
            self.hard_fault = true;
            self.overruns.reset();
        }

        record
    }

    // -------------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------------

    /// Explicit operator signal ending HumanTakeover and releasing a route
    /// held for human intervention. Returns `false` when neither applied.
    pub fn resume_autonomy(&mut self, at: DateTime<Utc>) -> bool {
        let resumed = self.decisions.resume_autonomy(at);
        let released = self.planner.status() == RouteStatus::HumanInterventionRequired
            && self.planner.resume(at);
        if resumed || released {
            self.overruns.reset();
            self.hard_fault = false;
            self.alert(AlertKind::AutonomyResumed, "autonomy resumed by operator");
        }
        resumed || released
    }

    pub fn start_route(
        &mut self,
        destination: Waypoint,
        algorithm: PlanningAlgorithm,
        at: DateTime<Utc>,
    ) -> Result<(), DriveError> {
        self.planner.start(destination, algorithm, at)
    }

    pub fn pause_route(&mut self, at: DateTime<Utc>) -> bool {
        self.planner.pause(at)
    }

    pub fn resume_route(&mut self, at: DateTime<Utc>) -> bool {
        self.planner.resume(at)
    }

    pub fn cancel_route(&mut self, at: DateTime<Utc>) -> bool {
        self.planner.cancel(at)
    }

    pub fn retry_route(&mut self, at: DateTime<Utc>) -> bool {
        self.planner.retry(at)
    }

    /// Attach actuator feedback to the last avoidance record and publish the
    /// completed record on [`Topic::History`].
    pub fn report_execution(&mut self, feedback: ActuatorFeedback) -> Option<AvoidanceRecord> {
        let record = self.avoidance.record_outcome(feedback)?;
        self.publish(Topic::History, EventPayload::Avoidance(Box::new(record)));
        Some(record)
    }

    /// Hand control to the human driver immediately.
    pub fn operator_stop(&mut self, reason: &str) {
        warn!(vehicle = %self.vehicle_id, reason, "operator stop");
        self.decisions.force_takeover();
        self.alert(AlertKind::OperatorStop, format!("operator stop: {reason}"));
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    fn alert(&self, kind: AlertKind, message: impl Into<String>) {
        let message = message.into();
        warn!(vehicle = %self.vehicle_id, ?kind, "{message}");
        self.publish(
            Topic::Alerts,
            EventPayload::Alert(Alert {
                vehicle_id: self.vehicle_id.clone(),
                kind,
                message,
            }),
        );
    }

    /// No subscribers on a topic is not an error for the pipeline.
    fn publish(&self, topic: Topic, payload: EventPayload) {
        if let Err(e) = self.bus.publish_to(topic, Event::new(self.source.clone(), payload)) {
            debug!(?topic, error = %e, "event not delivered");
        }
    }
}

/// Ego position and heading, once a Gps fix has been fused.
fn ego_pose(frame: &FusionFrame) -> Option<(Waypoint, f64)> {
    let ego = frame.ego;
    ego.speed_mps
        .map(|_| (Waypoint::new(ego.east_m, ego.north_m), ego.heading_rad))
}
