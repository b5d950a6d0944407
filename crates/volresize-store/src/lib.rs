//! Volresize Store - Access to the cluster objects the resize controller works on
//!
//! This crate provides:
//! - The `ObjectStore` trait over claims, volumes and secrets
//! - Resource-version checked writes reported as `UpdateOutcome`
//! - `MemoryStore` for tests and local runs, `HttpStore` for a real API server
//!   (connection settings, client-side rate limiting, list-then-watch notifications)
//! - The `LeaseLock` used by leader election

pub mod config;
pub mod error;
pub mod http;
pub mod lease;
pub mod limiter;
pub mod memory;
pub mod outcome;
pub mod traits;
mod watch;

#[cfg(test)]
mod fixtures;

pub use config::{ApiConfig, Credentials};
pub use error::{Result, StoreError};
pub use http::HttpStore;
pub use lease::{LeaseLock, MemoryLeaseLock};
pub use memory::MemoryStore;
pub use outcome::UpdateOutcome;
pub use traits::ObjectStore;
