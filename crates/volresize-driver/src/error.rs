// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable status code carried by a failed driver call
///
/// Names and wire spelling follow the gRPC status codes storage drivers
/// already report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverCode {
    NotFound,
    FailedPrecondition,
    Unimplemented,
    DeadlineExceeded,
    Unavailable,
    Internal,
    InvalidArgument,
    OutOfRange,
    ResourceExhausted,
    Aborted,
    Unknown,
}

impl DriverCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverCode::NotFound => "NOT_FOUND",
            DriverCode::FailedPrecondition => "FAILED_PRECONDITION",
            DriverCode::Unimplemented => "UNIMPLEMENTED",
            DriverCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            DriverCode::Unavailable => "UNAVAILABLE",
            DriverCode::Internal => "INTERNAL",
            DriverCode::InvalidArgument => "INVALID_ARGUMENT",
            DriverCode::OutOfRange => "OUT_OF_RANGE",
            DriverCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            DriverCode::Aborted => "ABORTED",
            DriverCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver boundary error type
#[derive(Error, Debug, Diagnostic)]
pub enum DriverError {
    /// The driver (or the transport in front of it) rejected a call
    #[error("Driver call failed with {code}: {message}")]
    #[diagnostic(
        code(volresize::driver::call_failed),
        help("Check the storage driver logs for the failed request")
    )]
    CallFailed {
        #[allow(unused)]
        code: DriverCode,
        #[allow(unused)]
        message: String,
    },

    /// The driver address could not be turned into a client
    #[error("Invalid driver address '{address}': {message}")]
    #[diagnostic(
        code(volresize::driver::invalid_address),
        help("Use an http:// or https:// URL, or host:port for plain HTTP")
    )]
    InvalidAddress {
        #[allow(unused)]
        address: String,
        #[allow(unused)]
        message: String,
    },

    /// The driver reported an unusable identity
    #[error("Driver reported an invalid name: {message}")]
    #[diagnostic(
        code(volresize::driver::invalid_identity),
        help("The driver must report a non-empty name from its identity service")
    )]
    InvalidIdentity {
        #[allow(unused)]
        message: String,
    },

    /// The driver can expand volumes neither on the controller nor on nodes
    #[error("Driver {driver} does not support volume expansion")]
    #[diagnostic(
        code(volresize::driver::expansion_not_supported),
        help("The driver must advertise controller or node volume expansion")
    )]
    ExpansionNotSupported {
        #[allow(unused)]
        driver: String,
    },
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn new(code: DriverCode, message: impl Into<String>) -> Self {
        Self::CallFailed {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    pub fn invalid_identity(message: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            message: message.into(),
        }
    }

    pub fn expansion_not_supported(driver: impl Into<String>) -> Self {
        Self::ExpansionNotSupported {
            driver: driver.into(),
        }
    }

    /// Status code of a failed call
    pub fn status_code(&self) -> Option<DriverCode> {
        match self {
            DriverError::CallFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Why a single resize attempt did not produce a new size
///
/// Every variant is recoverable from the controller's point of view; the
/// split only decides how the failure is logged, counted and retried.
#[derive(Error, Debug, Diagnostic)]
pub enum ResizeError {
    /// The driver no longer knows the volume
    #[error("Volume {handle} not found by driver: {message}")]
    #[diagnostic(code(volresize::driver::resize::not_found))]
    NotFound {
        #[allow(unused)]
        handle: String,
        #[allow(unused)]
        message: String,
    },

    /// The driver refuses to expand the volume while it is attached
    #[error("Volume {handle} is in use: {message}")]
    #[diagnostic(
        code(volresize::driver::resize::in_use),
        help("The driver may only expand the volume once it is detached")
    )]
    InUse {
        #[allow(unused)]
        handle: String,
        #[allow(unused)]
        message: String,
    },

    /// The driver does not implement controller expansion
    #[error("Controller expansion is not implemented by the driver: {message}")]
    #[diagnostic(code(volresize::driver::resize::unsupported))]
    Unsupported {
        #[allow(unused)]
        message: String,
    },

    /// Timeouts, unavailable transport and internal driver errors
    #[error("Transient driver failure ({code}): {message}")]
    #[diagnostic(code(volresize::driver::resize::transient))]
    Transient {
        #[allow(unused)]
        code: DriverCode,
        #[allow(unused)]
        message: String,
    },

    /// The request itself was rejected and will not succeed unchanged
    #[error("Driver rejected the expand request ({code}): {message}")]
    #[diagnostic(
        code(volresize::driver::resize::invalid_request),
        help("Check the requested size against the driver's limits")
    )]
    InvalidRequest {
        #[allow(unused)]
        code: DriverCode,
        #[allow(unused)]
        message: String,
    },

    /// The volume object cannot be turned into an expand request
    #[error("Volume {volume} cannot be resized: {message}")]
    #[diagnostic(code(volresize::driver::resize::invalid_volume))]
    InvalidVolume {
        #[allow(unused)]
        volume: String,
        #[allow(unused)]
        message: String,
    },

    /// The driver answered with a size that does not satisfy the request
    #[error("Driver granted {granted} bytes for a request of {requested} bytes")]
    #[diagnostic(code(volresize::driver::resize::short_grant))]
    ShortGrant {
        #[allow(unused)]
        requested: i64,
        #[allow(unused)]
        granted: i64,
    },
}

impl ResizeError {
    /// Classify a failed expand call
    pub fn from_driver(handle: &str, err: DriverError) -> Self {
        let message = err.to_string();
        let Some(code) = err.status_code() else {
            return ResizeError::Transient {
                code: DriverCode::Unknown,
                message,
            };
        };

        match code {
            DriverCode::NotFound => ResizeError::NotFound {
                handle: handle.to_string(),
                message,
            },
            DriverCode::FailedPrecondition => ResizeError::InUse {
                handle: handle.to_string(),
                message,
            },
            DriverCode::Unimplemented => ResizeError::Unsupported { message },
            DriverCode::InvalidArgument | DriverCode::OutOfRange => {
                ResizeError::InvalidRequest { code, message }
            }
            DriverCode::DeadlineExceeded
            | DriverCode::Unavailable
            | DriverCode::Internal
            | DriverCode::ResourceExhausted
            | DriverCode::Aborted
            | DriverCode::Unknown => ResizeError::Transient { code, message },
        }
    }

    /// Label used for the driver call metric
    pub fn label(&self) -> &'static str {
        match self {
            ResizeError::NotFound { .. } => "not_found",
            ResizeError::InUse { .. } => "in_use",
            ResizeError::Unsupported { .. } => "unsupported",
            ResizeError::Transient { .. } => "transient",
            ResizeError::InvalidRequest { .. } => "invalid_request",
            ResizeError::InvalidVolume { .. } => "invalid_volume",
            ResizeError::ShortGrant { .. } => "short_grant",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_spelling() {
        let json = serde_json::to_string(&DriverCode::FailedPrecondition).unwrap();
        assert_eq!(json, "\"FAILED_PRECONDITION\"");
        let code: DriverCode = serde_json::from_str("\"DEADLINE_EXCEEDED\"").unwrap();
        assert_eq!(code, DriverCode::DeadlineExceeded);
        assert_eq!(DriverCode::OutOfRange.to_string(), "OUT_OF_RANGE");
    }

    #[test]
    fn test_classification() {
        let classify = |code| ResizeError::from_driver("vol-1", DriverError::new(code, "x"));

        assert!(matches!(classify(DriverCode::NotFound), ResizeError::NotFound { .. }));
        assert!(matches!(
            classify(DriverCode::FailedPrecondition),
            ResizeError::InUse { .. }
        ));
        assert!(matches!(
            classify(DriverCode::Unimplemented),
            ResizeError::Unsupported { .. }
        ));
        for code in [DriverCode::InvalidArgument, DriverCode::OutOfRange] {
            assert!(matches!(classify(code), ResizeError::InvalidRequest { .. }));
        }
        for code in [
            DriverCode::DeadlineExceeded,
            DriverCode::Unavailable,
            DriverCode::Internal,
            DriverCode::ResourceExhausted,
            DriverCode::Aborted,
            DriverCode::Unknown,
        ] {
            assert!(matches!(classify(code), ResizeError::Transient { .. }));
        }
    }

    #[test]
    fn test_non_call_errors_are_transient() {
        let err = ResizeError::from_driver("vol-1", DriverError::invalid_identity("empty"));
        assert!(matches!(
            err,
            ResizeError::Transient {
                code: DriverCode::Unknown,
                ..
            }
        ));
        assert_eq!(err.label(), "transient");
    }

    #[test]
    fn test_error_display() {
        let err = DriverError::new(DriverCode::Unavailable, "connection refused");
        assert_eq!(
            err.to_string(),
            "Driver call failed with UNAVAILABLE: connection refused"
        );
        assert_eq!(err.status_code(), Some(DriverCode::Unavailable));
        assert_eq!(DriverError::expansion_not_supported("x").status_code(), None);
    }
}
