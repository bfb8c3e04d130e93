//! # Validation Module
//!
//! Naming rules shared by entity keys, attribute names and service names.
//!
//! ## Usage
//! ```rust
//! use prism_core::validation::{validate_entity_key, validate_service_name};
//!
//! assert!(validate_entity_key("light.kitchen").is_ok());
//! assert!(validate_service_name("turn_on").is_ok());
//! ```

use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Hub object ids are slugs; anything longer is certainly garbage.
pub const MAX_KEY_LEN: usize = 255;

// =============================================================================
// Slug Validators
// =============================================================================

fn is_slug_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'
}

fn validate_slug(field: &str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if !value.chars().all(is_slug_char) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only lowercase letters, digits and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates an entity key of the form `domain.object_id`.
///
/// ## Rules
/// - Exactly one `.` separating two non-empty slugs
/// - Slugs use `[a-z0-9_]`
/// - At most [`MAX_KEY_LEN`] characters overall
///
/// ## Example
/// ```rust
/// use prism_core::validation::validate_entity_key;
///
/// assert!(validate_entity_key("media_player.living_room").is_ok());
/// assert!(validate_entity_key("Light.Kitchen").is_err());
/// assert!(validate_entity_key("kitchen").is_err());
/// ```
pub fn validate_entity_key(key: &str) -> ValidationResult<()> {
    if key.is_empty() {
        return Err(ValidationError::Required {
            field: "entity_key".to_string(),
        });
    }

    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "entity_key".to_string(),
            max: MAX_KEY_LEN,
        });
    }

    let (domain, object_id) = key.split_once('.').ok_or_else(|| ValidationError::InvalidFormat {
        field: "entity_key".to_string(),
        reason: "expected domain.object_id".to_string(),
    })?;

    validate_slug("entity_key domain", domain)?;
    validate_slug("entity_key object_id", object_id)
}

/// Validates a bare domain such as `light`.
pub fn validate_domain(domain: &str) -> ValidationResult<()> {
    validate_slug("domain", domain)
}

/// Validates a bare service name such as `turn_on`.
pub fn validate_service_name(service: &str) -> ValidationResult<()> {
    validate_slug("service", service)
}

/// Validates a media volume level.
pub fn validate_volume(level: f64) -> ValidationResult<()> {
    if !(0.0..=1.0).contains(&level) {
        return Err(ValidationError::OutOfRange {
            field: "volume_level".to_string(),
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_entity_key() {
        assert!(validate_entity_key("light.kitchen").is_ok());
        assert!(validate_entity_key("sensor.temp_2").is_ok());

        assert!(matches!(
            validate_entity_key(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            validate_entity_key("kitchen"),
            Err(ValidationError::InvalidFormat { .. })
        ));
        assert!(validate_entity_key(".kitchen").is_err());
        assert!(validate_entity_key("light.").is_err());
        assert!(validate_entity_key("light.kitchen.extra").is_err());
        assert!(validate_entity_key("light.Kitchen").is_err());
        assert!(validate_entity_key("light.kitchen lamp").is_err());
    }

    #[test]
    fn test_validate_entity_key_length() {
        let long = format!("light.{}", "a".repeat(MAX_KEY_LEN));
        assert!(matches!(
            validate_entity_key(&long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_validate_service_name() {
        assert!(validate_service_name("media_play_pause").is_ok());
        assert!(validate_service_name("").is_err());
        assert!(validate_service_name("light.turn_on").is_err());
    }

    #[test]
    fn test_validate_volume() {
        assert!(validate_volume(0.0).is_ok());
        assert!(validate_volume(0.35).is_ok());
        assert!(validate_volume(1.0).is_ok());
        assert!(validate_volume(1.2).is_err());
        assert!(validate_volume(-0.1).is_err());
    }
}
