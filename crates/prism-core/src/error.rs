//! # Error Types
//!
//! Domain-specific error types for prism-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  prism-core errors (this file)                                         │
//! │  ├── CoreError        - Domain rule failures                           │
//! │  └── ValidationError  - Malformed keys and names                       │
//! │                                                                         │
//! │  prism-sync errors (separate crate)                                    │
//! │  ├── SyncError        - Connection, protocol, engine failures          │
//! │  └── CommandError     - Outcome of a single in-flight command          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → caller                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Domain rule failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// No hub service is known for writing this attribute.
    ///
    /// ## When This Occurs
    /// - Writing `state` on a read-only domain (`sensor`, `sun`, ...)
    /// - Writing a named attribute the domain has no setter for
    /// - Writing a value of the wrong shape (`light.kitchen` state = `42`)
    #[error("No service can set {attribute} on {entity} to {value}")]
    UnsupportedCommand {
        entity: String,
        attribute: String,
        value: String,
    },

    /// An action needs an entity of a different domain.
    #[error("{action} cannot target {entity}")]
    WrongDomain { action: String, entity: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (missing separator, bad characters).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: f64, max: f64 },
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::UnsupportedCommand {
            entity: "sensor.outdoor".into(),
            attribute: "state".into(),
            value: "12".into(),
        };
        assert_eq!(
            err.to_string(),
            "No service can set state on sensor.outdoor to 12"
        );

        let err: CoreError = ValidationError::Required {
            field: "entity_key".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Validation error: entity_key is required");
    }
}
