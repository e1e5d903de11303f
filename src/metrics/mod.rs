//! Metrics and health state
//!
//! Two views of the same activity:
//! - [`HealthState`]: process-wide atomic counters read by `/health`
//! - Prometheus metrics recorded through the `metrics` facade and rendered at `/metrics`
//!
//! Key metrics exposed:
//! - Uploads received, rejected, interrupted
//! - Tasks completed and failed, per failing stage
//! - Stage durations (remux, compress, upload)
//! - Worker pool occupancy

pub mod exporter;
pub mod health;
pub mod recorder;

pub use exporter::{install_recorder, metrics_route, render_metrics, spawn_upkeep, MetricsError};
pub use health::{DependencyStatus, HealthSnapshot, HealthState};
pub use recorder::{init_metrics, StageTimer};
