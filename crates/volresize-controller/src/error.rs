// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Controller error type
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Metrics could not be registered
    #[error("Failed to register metrics: {message}")]
    #[diagnostic(
        code(volresize::controller::metrics_registration),
        help("Each metric name may only be registered once per registry")
    )]
    MetricsRegistration {
        #[allow(unused)]
        message: String,
    },

    /// Leader election could not proceed
    #[error("Leader election failed: {message}")]
    #[diagnostic(
        code(volresize::controller::leader_election),
        help("Check that the lease namespace exists and the lease API is reachable")
    )]
    LeaderElection {
        #[allow(unused)]
        message: String,
    },

    /// Invalid controller configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(
        code(volresize::controller::invalid_config),
        help("Worker count and intervals must be greater than zero")
    )]
    InvalidConfig {
        #[allow(unused)]
        message: String,
    },

    /// Object store error
    #[error(transparent)]
    #[diagnostic(transparent)]
    StoreError(#[from] volresize_store::StoreError),

    /// Driver error
    #[error(transparent)]
    #[diagnostic(transparent)]
    DriverError(#[from] volresize_driver::DriverError),
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn metrics_registration(message: impl Into<String>) -> Self {
        Self::MetricsRegistration {
            message: message.into(),
        }
    }

    pub fn leader_election(message: impl Into<String>) -> Self {
        Self::LeaderElection {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

impl From<prometheus::Error> for ControllerError {
    fn from(e: prometheus::Error) -> Self {
        Self::metrics_registration(e.to_string())
    }
}
