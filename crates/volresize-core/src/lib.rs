//! Volresize Core - Fundamental types for the volume resize controller
//!
//! This crate provides:
//! - Claim identity (the work queue key)
//! - Storage quantity parsing and formatting
//! - Accessors and condition helpers over claim/volume objects
//! - Change notification types
//! - Error types with miette diagnostics

pub mod conditions;
pub mod error;
pub mod events;
pub mod objects;
pub mod quantity;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::{ObjectEvent, WatchEventType};
pub use quantity::{format_storage, parse_storage};
pub use types::{ClaimKey, DEFAULT_NAMESPACE};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
