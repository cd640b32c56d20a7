//! Core library for progressive canary delivery
//!
//! This crate provides the core functionality for:
//! - Metrics collection and windowed aggregation per version
//! - Statistical anomaly detection on watched metrics
//! - Analysis verdicts and the canary promotion state machine
//! - Deterministic A/B variant assignment
//! - Health checks and observability

pub mod abtest;
pub mod analysis;
pub mod anomaly;
pub mod collector;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod store;

pub use analysis::{analyze, Analysis, Verdict};
pub use error::{CanaryError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ControllerMetrics, StructuredLogger};
