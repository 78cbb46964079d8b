//! `drivecore-runtime` – per-vehicle cycle engine.
//!
//! Wires the perception, decision and planning stages into one synchronous
//! cycle per vehicle and runs many vehicles side by side.
//!
//! # Modules
//!
//! - [`pipeline`] – [`VehiclePipeline`][pipeline::VehiclePipeline]: owns one
//!   instance of every stage for a single vehicle and runs
//!   normalize → fuse → score → decide → avoid → plan once per
//!   [`tick`][pipeline::VehiclePipeline::tick], publishing a
//!   [`CycleRecord`][drivecore_types::CycleRecord], alerts and sensor health
//!   on the event bus. Avoidance and planning are skipped (and their last
//!   outputs repeated) when the cycle budget is already spent.
//! - [`fleet`] – [`Fleet`][fleet::Fleet]: one Tokio task per vehicle with a
//!   fixed tick period, skipped missed ticks, sample routing by vehicle id
//!   and [`ControlCommand`][fleet::ControlCommand]s applied between cycles.
//! - [`overrun_guard`] – [`OverrunGuard`][overrun_guard::OverrunGuard]:
//!   detects repeated hard-deadline overruns, the fatal condition that forces
//!   a human takeover.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!   Set `OTEL_EXPORTER_OTLP_ENDPOINT` to export the per-cycle spans.

pub mod fleet;
pub mod overrun_guard;
pub mod pipeline;
pub mod telemetry;

pub use fleet::{ControlCommand, Fleet};
pub use overrun_guard::OverrunGuard;
pub use pipeline::{CycleTimer, VehiclePipeline, WallTimer};
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
