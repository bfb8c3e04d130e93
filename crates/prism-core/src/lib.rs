//! # prism-core: Pure Domain Logic for Prism
//!
//! Everything in this crate describes *what* the hub mirror contains and
//! *what* a user gesture means. Nothing here touches a socket or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Prism Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 UI / CLI (consumers of the engine)              │   │
//! │  │     dashboard tiles ──► click / scroll ──► change listeners     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 prism-sync (SyncEngine, store, transport)       │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ prism-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   value   │  │  service  │  │  actions  │  │   │
//! │  │   │ EntityKey │  │ Attribute │  │ Service   │  │ Widget    │  │   │
//! │  │   │  Entity   │  │   Value   │  │  Call     │  │ Debouncer │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS • PURE FUNCTIONS              │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entity identity and records
//! - [`value`] - The closed set of attribute value shapes
//! - [`service`] - Mapping an attribute write onto a hub service call
//! - [`actions`] - Dashboard widget gestures and click debouncing
//! - [`error`] - Domain error types
//! - [`validation`] - Key and service name rules
//!
//! ## Example Usage
//!
//! ```rust
//! use prism_core::{resolve_command, Attribute, AttributeValue, EntityKey};
//!
//! let key: EntityKey = "light.kitchen".parse().unwrap();
//! let call = resolve_command(&key, &Attribute::State, &AttributeValue::from("on")).unwrap();
//!
//! assert_eq!(call.domain, "light");
//! assert_eq!(call.service, "turn_on");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod actions;
pub mod error;
pub mod service;
pub mod types;
pub mod validation;
pub mod value;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use actions::{plan_action, ActionPlan, Debouncer, OptimisticWrite, WidgetAction};
pub use error::{CoreError, ValidationError};
pub use service::{resolve_command, ServiceCall, ServiceTarget};
pub use types::*;
pub use value::AttributeValue;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Domain used when a service name is given without one.
pub const DEFAULT_SERVICE_DOMAIN: &str = "homeassistant";

/// Cooldown applied to repeated clicks on the same entity.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Title shown for hub notifications that carry none.
pub const DEFAULT_NOTIFICATION_TITLE: &str = "Home Assistant";
