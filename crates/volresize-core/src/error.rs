// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for claim/volume handling
#[derive(Error, Debug, Diagnostic)]
pub enum CoreError {
    /// A storage quantity could not be parsed
    #[error("Invalid storage quantity '{value}': {reason}")]
    #[diagnostic(
        code(volresize::core::invalid_quantity),
        help("Use a plain byte count or a suffixed value such as '512Mi', '10Gi' or '1.5T'")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// An object is missing a field the controller depends on
    #[error("{object} is missing required field '{field}'")]
    #[diagnostic(
        code(volresize::core::missing_field),
        help("The object may have been created by a client that does not populate '{field}'")
    )]
    MissingField {
        #[allow(unused)]
        object: String,
        #[allow(unused)]
        field: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            object: object.into(),
            field: field.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = CoreError::invalid_quantity("10Qi", "unknown suffix");
        assert!(matches!(err, CoreError::InvalidQuantity { .. }));
        assert!(err.to_string().contains("10Qi"));

        let err = CoreError::missing_field("PersistentVolume", "spec.csi");
        assert_eq!(
            err.to_string(),
            "PersistentVolume is missing required field 'spec.csi'"
        );
    }
}
