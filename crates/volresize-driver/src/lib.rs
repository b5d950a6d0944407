//! Volresize Driver - Storage driver boundary and the Resizer
//!
//! This crate provides:
//! - The `DriverClient` trait with its request, response and capability types
//! - Driver status codes and the resize failure taxonomy
//! - `MockDriver` for tests and local runs, `HttpDriverClient` for real drivers
//! - `Resizer`, which probes a driver once and issues expand calls against it

pub mod client;
pub mod error;
pub mod http;
pub mod mock;
pub mod resizer;
pub mod types;

pub use client::DriverClient;
pub use error::{DriverCode, DriverError, ResizeError, Result};
pub use http::HttpDriverClient;
pub use mock::MockDriver;
pub use resizer::{sanitize_name, Resizer, LOCK_NAME_PREFIX};
pub use types::{
    AccessType, DriverCapabilities, DriverCapability, ExpandRequest, ExpandResponse,
    ExpansionOutcome, VolumeCapability,
};
