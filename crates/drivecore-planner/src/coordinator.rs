//! Path Planner Coordinator.
//!
//! Owns the vehicle's [`RouteState`] and is the only thing that mutates it.
//! Everyone else reads the `Arc<RouteState>` returned by
//! [`PathPlannerCoordinator::snapshot`] or [`PathPlannerCoordinator::tick`];
//! mutations go through [`Arc::make_mut`], so outstanding snapshots never
//! change underneath their readers.
//!
//! # Status machine
//!
//! ```text
//! Planning ──► Active ──► Recalculating ──► Active
//!                │  ▲            │
//!                ▼  │            ▼
//!       WaitingForConditions   Error ──retry──► Recalculating
//!
//! Active/Recalculating/WaitingForConditions ──pause──► Paused ──resume──► Active
//! any ──cancel──► Cancelled        Active ──arrival──► Completed
//! any ──RequestHumanIntervention──► HumanInterventionRequired ──resume──► …
//! ```
//!
//! # Recalculation
//!
//! While Active, a recalculation is triggered by an upstream emergency
//! decision, more than `obstacle_threshold` obstacles in the detection
//! window, path deviation above `deviation_threshold_m`, or environmental
//! risk rising above `replan_environmental_risk`. A Recalculating route
//! with no request in flight re-issues its request. Risk at or above
//! `hold_environmental_risk` parks the route in `WaitingForConditions`.
//!
//! Requests are rate limited by a `governor` quota driven by cycle time and
//! planned by a [`RoutingStrategy`] off the pipeline thread
//! (`spawn_blocking`) when a Tokio runtime is available, inline otherwise.
//! The result is polled once per cycle, so it is adopted no earlier than the
//! next tick. Only one request is in flight; a result whose generation is not
//! the latest requested is discarded. The previous waypoints stay active
//! until a new route is adopted.
//!
//! Positions are in the local east/north frame; headings are
//! counter-clockwise from east.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::{PI, TAU};
use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use drivecore_types::{
    AiDecision, AvoidanceAction, AvoidanceRecord, DecisionKind, DriveError, ObstacleCandidate,
    PipelineConfig, PlanningAlgorithm, RecalculationReason, RecalculationThresholds, RouteState,
    RouteStatus, Side, Waypoint, path_length,
};
use governor::clock::FakeRelativeClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::strategy::{
    GridAStarStrategy, ObstacleZone, RouteRequest, RoutingStrategy, StraightLineStrategy,
};

/// Heading change at the next waypoint that is announced as a turn.
const TURN_THRESHOLD_RAD: f64 = PI / 6.0;
const MIN_OBSTACLE_RADIUS_M: f64 = 0.5;

type Limiter = RateLimiter<
    NotKeyed,
    InMemoryState,
    FakeRelativeClock,
    governor::middleware::NoOpMiddleware<governor::nanos::Nanos>,
>;
type PlanResult = Result<Vec<Waypoint>, DriveError>;

/// What the coordinator sees of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct PlannerInput<'a> {
    pub at: DateTime<Utc>,
    pub decision: &'a AiDecision,
    pub obstacles: &'a [ObstacleCandidate],
    /// Ego position and heading; `None` before the first Gps fix.
    pub ego: Option<(Waypoint, f64)>,
    pub environmental_risk: f64,
    /// This cycle's avoidance record, if any.
    pub avoidance: Option<&'a AvoidanceRecord>,
}

struct InFlight {
    generation: u64,
    reason: RecalculationReason,
    algorithm: PlanningAlgorithm,
    rx: oneshot::Receiver<PlanResult>,
}

pub struct PathPlannerCoordinator {
    route: Arc<RouteState>,
    thresholds: RecalculationThresholds,
    strategies: HashMap<PlanningAlgorithm, Arc<dyn RoutingStrategy>>,
    algorithm: PlanningAlgorithm,
    limiter: Limiter,
    clock: FakeRelativeClock,
    clock_at: Option<DateTime<Utc>>,
    in_flight: Option<InFlight>,
    latest_generation: u64,
    pending: Option<RecalculationReason>,
    /// Status to return to when human intervention is resolved.
    before_intervention: Option<RouteStatus>,
    obstacle_window: VecDeque<(DateTime<Utc>, usize)>,
    zones: Vec<ObstacleZone>,
    ego: Option<(Waypoint, f64)>,
    cross_track_m: f64,
    next_waypoint: usize,
    env_above_replan: bool,
    last_action: Option<AvoidanceAction>,
}

impl PathPlannerCoordinator {
    /// Coordinator with the built-in A* and straight-line strategies.
    pub fn new(config: &PipelineConfig) -> Self {
        let clock = FakeRelativeClock::default();
        let per_minute =
            NonZeroU32::new(config.max_recalculations_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct_with_clock(Quota::per_minute(per_minute), clock.clone());

        let mut coordinator = Self {
            route: Arc::new(RouteState::default()),
            thresholds: config.recalculation,
            strategies: HashMap::new(),
            algorithm: PlanningAlgorithm::AStar,
            limiter,
            clock,
            clock_at: None,
            in_flight: None,
            latest_generation: 0,
            pending: None,
            before_intervention: None,
            obstacle_window: VecDeque::new(),
            zones: Vec::new(),
            ego: None,
            cross_track_m: 0.0,
            next_waypoint: 0,
            env_above_replan: false,
            last_action: None,
        };
        coordinator.register(Arc::new(GridAStarStrategy::default()));
        coordinator.register(Arc::new(StraightLineStrategy::default()));
        coordinator
    }

    /// Register (or replace) the strategy for its algorithm.
    pub fn with_strategy(mut self, strategy: Arc<dyn RoutingStrategy>) -> Self {
        self.register(strategy);
        self
    }

    fn register(&mut self, strategy: Arc<dyn RoutingStrategy>) {
        self.strategies.insert(strategy.algorithm(), strategy);
    }

    pub fn snapshot(&self) -> Arc<RouteState> {
        Arc::clone(&self.route)
    }

    pub fn status(&self) -> RouteStatus {
        self.route.status
    }

    // ────────────────────────────────────────────────────────────────────────
    // Control
    // ────────────────────────────────────────────────────────────────────────

    /// Plan a new route to `destination` with `algorithm`.
    ///
    /// The request is issued on the next tick with a known ego position.
    /// Any request still in flight is superseded.
    pub fn start(
        &mut self,
        destination: Waypoint,
        algorithm: PlanningAlgorithm,
        at: DateTime<Utc>,
    ) -> Result<(), DriveError> {
        if self.route.status == RouteStatus::HumanInterventionRequired {
            return Err(DriveError::Routing(
                "route is held for human intervention".into(),
            ));
        }
        if !self.strategies.contains_key(&algorithm) {
            return Err(DriveError::Routing(format!(
                "no routing strategy registered for {algorithm:?}"
            )));
        }
        self.advance_clock(at);
        self.algorithm = algorithm;
        self.latest_generation += 1;
        self.pending = Some(RecalculationReason::InitialPlan);
        self.next_waypoint = 0;
        self.route = Arc::new(RouteState {
            status: RouteStatus::Planning,
            destination: Some(destination),
            algorithm: Some(algorithm),
            generation: self.latest_generation,
            updated_at: Some(at),
            ..RouteState::default()
        });
        info!(?destination, ?algorithm, "route requested");
        Ok(())
    }

    pub fn pause(&mut self, at: DateTime<Utc>) -> bool {
        match self.route.status {
            RouteStatus::Planning
            | RouteStatus::Active
            | RouteStatus::Recalculating
            | RouteStatus::WaitingForConditions => {
                self.set_status(RouteStatus::Paused, at);
                true
            }
            _ => false,
        }
    }

    /// Resume a paused route, or release a route held for human
    /// intervention.
    pub fn resume(&mut self, at: DateTime<Utc>) -> bool {
        match self.route.status {
            RouteStatus::Paused => {
                if self.route.waypoints.is_empty() {
                    self.pending.get_or_insert(RecalculationReason::InitialPlan);
                    self.set_status(RouteStatus::Planning, at);
                } else {
                    self.set_status(RouteStatus::Active, at);
                }
                true
            }
            RouteStatus::HumanInterventionRequired => {
                let previous = self.before_intervention.take().unwrap_or_default();
                let next = if previous.is_final() || previous == RouteStatus::Paused {
                    previous
                } else if self.route.destination.is_some() {
                    self.pending = Some(RecalculationReason::Retry);
                    RouteStatus::Recalculating
                } else {
                    RouteStatus::Planning
                };
                info!(status = ?next, "route released from human intervention");
                self.set_status(next, at);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> bool {
        if self.route.status.is_final() {
            return false;
        }
        self.in_flight = None;
        self.pending = None;
        self.set_status(RouteStatus::Cancelled, at);
        info!("route cancelled");
        true
    }

    /// Re-plan a route that ended in `Error`.
    pub fn retry(&mut self, at: DateTime<Utc>) -> bool {
        if self.route.status != RouteStatus::Error {
            return false;
        }
        self.pending = Some(RecalculationReason::Retry);
        self.set_status(RouteStatus::Recalculating, at);
        true
    }

    /// Maneuver the route wants the decision machine to perform when nothing
    /// more urgent applies.
    pub fn pending_maneuver(&self) -> Option<DecisionKind> {
        match self.route.status {
            RouteStatus::WaitingForConditions => Some(DecisionKind::StopAndWait),
            RouteStatus::Completed => Some(DecisionKind::Park),
            RouteStatus::Active => self.turn_ahead().map(DecisionKind::Turn),
            _ => None,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Per-cycle update
    // ────────────────────────────────────────────────────────────────────────

    pub fn tick(&mut self, input: &PlannerInput<'_>) -> Arc<RouteState> {
        let at = input.at;
        self.advance_clock(at);
        if input.ego.is_some() {
            self.ego = input.ego;
        }
        self.record_obstacles(input);

        if input.decision.kind == DecisionKind::RequestHumanIntervention {
            self.require_intervention(at);
        }

        self.poll(at);
        self.track_progress(input);

        if self.route.destination.is_some()
            && matches!(
                self.route.status,
                RouteStatus::Planning
                    | RouteStatus::Active
                    | RouteStatus::Recalculating
                    | RouteStatus::WaitingForConditions
            )
        {
            self.evaluate_triggers(input);
        }

        self.issue_pending(at);
        self.snapshot()
    }

    fn require_intervention(&mut self, at: DateTime<Utc>) {
        if self.route.status == RouteStatus::HumanInterventionRequired {
            return;
        }
        warn!(from = ?self.route.status, "route held for human intervention");
        self.before_intervention = Some(self.route.status);
        self.set_status(RouteStatus::HumanInterventionRequired, at);
    }

    fn evaluate_triggers(&mut self, input: &PlannerInput<'_>) {
        let t = self.thresholds;
        let env = input.environmental_risk;
        let status = self.route.status;

        if env >= t.hold_environmental_risk {
            if status != RouteStatus::WaitingForConditions {
                info!(environmental_risk = env, "route waiting for conditions");
                self.set_status(RouteStatus::WaitingForConditions, input.at);
            }
            self.env_above_replan = true;
            return;
        }
        if status == RouteStatus::WaitingForConditions {
            if env < t.replan_environmental_risk {
                info!(environmental_risk = env, "conditions improved, replanning");
                self.env_above_replan = false;
                self.pending = Some(RecalculationReason::EnvironmentalConditions);
                self.set_status(RouteStatus::Recalculating, input.at);
            }
            return;
        }
        if status == RouteStatus::Planning {
            if self.route.waypoints.is_empty() && self.in_flight.is_none() {
                self.pending.get_or_insert(RecalculationReason::InitialPlan);
            }
            return;
        }

        let env_rising = env > t.replan_environmental_risk && !self.env_above_replan;
        self.env_above_replan = env > t.replan_environmental_risk;

        let obstacles = self.obstacles_in_window();
        let deviation = self.route.progress.cumulative_deviation_m.max(self.cross_track_m);
        let reason = if matches!(
            input.decision.kind,
            DecisionKind::EmergencyBrake | DecisionKind::EmergencyStop
        ) {
            Some(RecalculationReason::UpstreamEmergency)
        } else if obstacles > t.obstacle_threshold {
            Some(RecalculationReason::ObstacleDensity)
        } else if deviation > t.deviation_threshold_m {
            Some(RecalculationReason::PathDeviation)
        } else if env_rising {
            Some(RecalculationReason::EnvironmentalConditions)
        } else if status == RouteStatus::Recalculating && self.in_flight.is_none() {
            Some(RecalculationReason::PendingRequest)
        } else {
            None
        };

        if let Some(reason) = reason {
            if status == RouteStatus::Active {
                info!(?reason, obstacles, deviation_m = deviation, "route recalculation triggered");
                self.set_status(RouteStatus::Recalculating, input.at);
            }
            self.pending.get_or_insert(reason);
        }
    }

    fn issue_pending(&mut self, at: DateTime<Utc>) {
        if self.in_flight.is_some()
            || !matches!(
                self.route.status,
                RouteStatus::Planning | RouteStatus::Recalculating
            )
        {
            return;
        }
        let Some(reason) = self.pending else {
            return;
        };
        let Some(destination) = self.route.destination else {
            self.pending = None;
            return;
        };
        let Some((origin, _)) = self.ego else {
            debug!(?reason, "route request waiting for a position fix");
            return;
        };
        if self.limiter.check().is_err() {
            debug!(?reason, "route recalculation rate limited");
            return;
        }
        let Some(strategy) = self.strategies.get(&self.algorithm).cloned() else {
            warn!(algorithm = ?self.algorithm, "no routing strategy registered");
            self.pending = None;
            self.set_status(RouteStatus::Error, at);
            return;
        };

        if reason != RecalculationReason::InitialPlan {
            self.latest_generation += 1;
        }
        let request = RouteRequest {
            origin,
            destination,
            obstacles: self.zones.clone(),
        };
        let (tx, rx) = oneshot::channel();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    let _ = tx.send(strategy.plan(&request));
                });
            }
            Err(_) => {
                let _ = tx.send(strategy.plan(&request));
            }
        }
        debug!(?reason, generation = self.latest_generation, "route request issued");
        self.in_flight = Some(InFlight {
            generation: self.latest_generation,
            reason,
            algorithm: self.algorithm,
            rx,
        });
        self.pending = None;
    }

    fn poll(&mut self, at: DateTime<Utc>) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        let result = match flight.rx.try_recv() {
            Err(TryRecvError::Empty) => return,
            Ok(result) => result,
            Err(TryRecvError::Closed) => Err(DriveError::Routing("routing task aborted".into())),
        };
        let Some(flight) = self.in_flight.take() else {
            return;
        };

        if flight.generation != self.latest_generation {
            debug!(generation = flight.generation, latest = self.latest_generation, "superseded route result discarded");
            return;
        }
        let status = self.route.status;
        if matches!(
            status,
            RouteStatus::HumanInterventionRequired | RouteStatus::Cancelled | RouteStatus::Completed
        ) {
            debug!(?status, "route result discarded");
            return;
        }

        match result {
            Ok(waypoints) => {
                let total = path_length(&waypoints);
                let route = Arc::make_mut(&mut self.route);
                route.waypoints = waypoints;
                route.generation = flight.generation;
                route.algorithm = Some(flight.algorithm);
                route.progress.total_distance_m = total;
                route.progress.remaining_distance_m = total;
                route.progress.cumulative_deviation_m = 0.0;
                if flight.reason != RecalculationReason::InitialPlan {
                    route.progress.recalculations += 1;
                }
                route.updated_at = Some(at);
                if matches!(status, RouteStatus::Planning | RouteStatus::Recalculating) {
                    route.status = RouteStatus::Active;
                }
                self.next_waypoint = 0;
                // Triggers raised while the request was in flight are answered
                // by this route.
                self.pending = None;
                info!(
                    generation = flight.generation,
                    reason = ?flight.reason,
                    waypoints = route.waypoints.len(),
                    length_m = total,
                    "route adopted"
                );
            }
            Err(e) => {
                warn!(error = %e, reason = ?flight.reason, "route planning failed");
                if status != RouteStatus::Paused {
                    self.set_status(RouteStatus::Error, at);
                }
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Progress
    // ────────────────────────────────────────────────────────────────────────

    /// A maneuver is a run of consecutive cycles issuing the same confirmed
    /// action. A different action, or a cycle without one, starts a new one.
    fn track_progress(&mut self, input: &PlannerInput<'_>) {
        match input.avoidance.filter(|r| !r.awaiting_confirmation) {
            Some(record) if self.last_action != Some(record.action) => {
                self.last_action = Some(record.action);
                let progress = &mut Arc::make_mut(&mut self.route).progress;
                progress.avoidance_maneuvers += 1;
                progress.cumulative_deviation_m += record.path_deviation_m;
                if matches!(
                    record.action,
                    AvoidanceAction::EmergencyBrake | AvoidanceAction::CompleteStop
                ) {
                    progress.emergency_stops += 1;
                }
            }
            Some(_) => {}
            None => self.last_action = None,
        }

        let Some((ego, _)) = self.ego else {
            return;
        };
        if self.route.waypoints.len() < 2 {
            return;
        }
        let (cross_track, segment, remaining) = project(&self.route.waypoints, &ego);
        self.cross_track_m = cross_track;
        self.next_waypoint = segment + 1;
        Arc::make_mut(&mut self.route).progress.remaining_distance_m = remaining;

        if self.route.status == RouteStatus::Active
            && let Some(destination) = self.route.destination
            && ego.distance_to(&destination) <= self.thresholds.arrival_tolerance_m
        {
            let route = Arc::make_mut(&mut self.route);
            route.progress.remaining_distance_m = 0.0;
            route.status = RouteStatus::Completed;
            route.updated_at = Some(input.at);
            info!(rating = ?route.performance_rating(), "route completed");
        }
    }

    fn turn_ahead(&self) -> Option<Side> {
        let (ego, heading) = self.ego?;
        let next = self.route.waypoints.get(self.next_waypoint)?;
        if ego.distance_to(next) < f64::EPSILON {
            return None;
        }
        let bearing = (next.north_m - ego.north_m).atan2(next.east_m - ego.east_m);
        let relative = (bearing - heading + PI).rem_euclid(TAU) - PI;
        if relative.abs() <= TURN_THRESHOLD_RAD {
            None
        } else if relative > 0.0 {
            Some(Side::Left)
        } else {
            Some(Side::Right)
        }
    }

    fn record_obstacles(&mut self, input: &PlannerInput<'_>) {
        let window = Duration::milliseconds(self.thresholds.obstacle_window_ms as i64);
        self.obstacle_window.push_back((input.at, input.obstacles.len()));
        while self
            .obstacle_window
            .front()
            .is_some_and(|(t, _)| input.at - *t > window)
        {
            self.obstacle_window.pop_front();
        }

        self.zones.clear();
        if let Some((ego, heading)) = input.ego.or(self.ego) {
            let (sin, cos) = heading.sin_cos();
            self.zones.extend(input.obstacles.iter().map(|c| {
                let (x, y) = c.position();
                ObstacleZone {
                    center: Waypoint::new(ego.east_m + x * cos - y * sin, ego.north_m + x * sin + y * cos),
                    radius_m: (c.width_m / 2.0).max(MIN_OBSTACLE_RADIUS_M),
                }
            }));
        }
    }

    /// Most obstacles seen in a single frame within the detection window.
    fn obstacles_in_window(&self) -> usize {
        self.obstacle_window.iter().map(|(_, n)| *n).max().unwrap_or(0)
    }

    fn advance_clock(&mut self, at: DateTime<Utc>) {
        match self.clock_at {
            Some(prev) if at > prev => {
                self.clock.advance((at - prev).to_std().unwrap_or_default());
                self.clock_at = Some(at);
            }
            Some(_) => {}
            None => self.clock_at = Some(at),
        }
    }

    fn set_status(&mut self, status: RouteStatus, at: DateTime<Utc>) {
        let route = Arc::make_mut(&mut self.route);
        route.status = status;
        route.updated_at = Some(at);
    }
}

/// Closest point of `p` on the polyline: (cross-track distance, segment
/// index, remaining distance along the route).
fn project(waypoints: &[Waypoint], p: &Waypoint) -> (f64, usize, f64) {
    let mut best = (f64::INFINITY, 0, 0.0);
    for (k, seg) in waypoints.windows(2).enumerate() {
        let (a, b) = (seg[0], seg[1]);
        let (dx, dy) = (b.east_m - a.east_m, b.north_m - a.north_m);
        let len2 = dx * dx + dy * dy;
        let t = if len2 > 0.0 {
            (((p.east_m - a.east_m) * dx + (p.north_m - a.north_m) * dy) / len2).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let foot = Waypoint::new(a.east_m + t * dx, a.north_m + t * dy);
        let d = p.distance_to(&foot);
        if d < best.0 {
            best = (d, k, foot.distance_to(&b) + path_length(&waypoints[k + 1..]));
        }
    }
    best
}
