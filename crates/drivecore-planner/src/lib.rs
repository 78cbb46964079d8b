//! `drivecore-planner` – Route coordination
//!
//! - [`coordinator`] – [`PathPlannerCoordinator`]: owns the route status
//!   machine, decides when to recalculate and polls routing results without
//!   blocking the pipeline.
//! - [`strategy`] – the [`RoutingStrategy`] seam and the built-in
//!   [`GridAStarStrategy`] and [`StraightLineStrategy`].

pub mod coordinator;
pub mod strategy;

pub use coordinator::{PathPlannerCoordinator, PlannerInput};
pub use strategy::{
    GridAStarStrategy, ObstacleZone, RouteRequest, RoutingStrategy, StraightLineStrategy,
};
