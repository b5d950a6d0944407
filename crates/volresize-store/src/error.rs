// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Object store error type
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// The request never produced a response
    #[error("Object store request failed: {message}")]
    #[diagnostic(
        code(volresize::store::request_failed),
        help("Check that the configured API server is reachable")
    )]
    RequestFailed {
        #[allow(unused)]
        message: String,
    },

    /// The API server answered with an unexpected status
    #[error("{operation} failed with status {status}: {body}")]
    #[diagnostic(
        code(volresize::store::unexpected_status),
        help("Inspect the API server logs for the rejected request")
    )]
    UnexpectedStatus {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        status: u16,
        #[allow(unused)]
        body: String,
    },

    /// A response body could not be decoded
    #[error("Failed to decode {what}: {message}")]
    #[diagnostic(
        code(volresize::store::decode_failed),
        help("The API server may be running an incompatible version")
    )]
    DecodeFailed {
        #[allow(unused)]
        what: String,
        #[allow(unused)]
        message: String,
    },

    /// An object handed to the store is not usable
    #[error("Invalid object: {message}")]
    #[diagnostic(
        code(volresize::store::invalid_object),
        help("Objects written through the store need a name and a resourceVersion")
    )]
    InvalidObject {
        #[allow(unused)]
        message: String,
    },

    /// API server connection settings are unusable
    #[error("Invalid API connection settings: {message}")]
    #[diagnostic(
        code(volresize::store::config),
        help("Pass --kubeconfig, run inside a cluster, or point --api-url at a reachable server")
    )]
    Config {
        #[allow(unused)]
        message: String,
    },

    /// Core library error
    #[error(transparent)]
    #[diagnostic(transparent)]
    CoreError(#[from] volresize_core::CoreError),
}

/// Result type alias for object store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::RequestFailed {
            message: message.into(),
        }
    }

    pub fn unexpected_status(
        operation: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        Self::UnexpectedStatus {
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    pub fn decode_failed(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecodeFailed {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_object(message: impl Into<String>) -> Self {
        Self::InvalidObject {
            message: message.into(),
        }
    }
}
