//! Volresize Controller - Drives PersistentVolumeClaim expansion
//!
//! This crate provides:
//! - A deduplicating work queue with per-claim exponential backoff
//! - The reconciler that walks one claim through controller expansion
//! - Worker, notification and resync loops around them
//! - Leader gating (standalone or lease based)
//! - Prometheus metrics

pub mod controller;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod reconciler;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use controller::{ControllerConfig, ResizeController};
pub use error::{ControllerError, Result};
pub use leader::{LeaderGate, LeaseConfig, LeaseElector, RunFn, Standalone};
pub use metrics::{encode_text, ResizerMetrics};
pub use queue::{ItemExponentialFailureRateLimiter, RateLimiter, RateLimiterConfig, WorkQueue};
pub use reconciler::{
    FailureKind, InUsePolicy, ReconcileError, ReconcileOutcome, Reconciler,
};
