//! # Domain Types
//!
//! Identity and content of a mirrored hub entity.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   EntityKey     │   │     Entity      │   │   Attribute     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  "light.desk"   │   │  key            │   │  State          │       │
//! │  │  domain()       │   │  state          │   │  Named(String)  │       │
//! │  │  object_id()    │   │  attributes     │   │                 │       │
//! │  └─────────────────┘   │  last_updated   │   └─────────────────┘       │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::validation::validate_entity_key;
use crate::value::AttributeValue;

// =============================================================================
// Entity Key
// =============================================================================

/// Validated `domain.object_id` identifier of a hub entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ValidationError> {
        let key = key.into();
        validate_entity_key(&key)?;
        Ok(EntityKey(key))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the dot (`light` in `light.kitchen`).
    pub fn domain(&self) -> &str {
        self.0.split_once('.').map(|(d, _)| d).unwrap_or(&self.0)
    }

    /// The part after the dot (`kitchen` in `light.kitchen`).
    pub fn object_id(&self) -> &str {
        self.0.split_once('.').map(|(_, o)| o).unwrap_or("")
    }
}

impl TryFrom<String> for EntityKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EntityKey::new(value)
    }
}

impl FromStr for EntityKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKey::new(s)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

impl Borrow<str> for EntityKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Attribute
// =============================================================================

/// Addresses one value on an entity: its primary state or a named attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Attribute {
    State,
    Named(String),
}

impl Attribute {
    pub fn named(name: impl Into<String>) -> Self {
        Attribute::Named(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Attribute::State => "state",
            Attribute::Named(name) => name,
        }
    }
}

impl From<&str> for Attribute {
    fn from(s: &str) -> Self {
        match s {
            "state" => Attribute::State,
            other => Attribute::Named(other.to_string()),
        }
    }
}

impl From<String> for Attribute {
    fn from(s: String) -> Self {
        match s.as_str() {
            "state" => Attribute::State,
            _ => Attribute::Named(s),
        }
    }
}

impl From<Attribute> for String {
    fn from(attribute: Attribute) -> Self {
        match attribute {
            Attribute::State => "state".to_string(),
            Attribute::Named(name) => name,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Entity
// =============================================================================

/// One hub-side object as last known locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,

    /// Primary state (`"on"`, `"21.5"`, `"playing"`, ...).
    pub state: AttributeValue,

    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,

    /// When the hub last changed this entity.
    pub last_updated: DateTime<Utc>,
}

impl Entity {
    pub fn new(key: EntityKey, state: impl Into<AttributeValue>, last_updated: DateTime<Utc>) -> Self {
        Entity {
            key,
            state: state.into(),
            attributes: BTreeMap::new(),
            last_updated,
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[inline]
    pub fn domain(&self) -> &str {
        self.key.domain()
    }

    pub fn get(&self, attribute: &Attribute) -> Option<&AttributeValue> {
        match attribute {
            Attribute::State => Some(&self.state),
            Attribute::Named(name) => self.attributes.get(name),
        }
    }

    /// Writes (or with `None`, clears) one attribute and returns what was
    /// there before. Clearing the primary state sets it to `Null`.
    pub fn set(&mut self, attribute: &Attribute, value: Option<AttributeValue>) -> Option<AttributeValue> {
        match attribute {
            Attribute::State => Some(std::mem::replace(
                &mut self.state,
                value.unwrap_or(AttributeValue::Null),
            )),
            Attribute::Named(name) => match value {
                Some(v) => self.attributes.insert(name.clone(), v),
                None => self.attributes.remove(name),
            },
        }
    }

    /// Compares state and attributes, ignoring timestamps.
    pub fn same_content(&self, other: &Entity) -> bool {
        self.state == other.state && self.attributes == other.attributes
    }

    /// Human-readable label, falling back to the key.
    pub fn friendly_name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(AttributeValue::as_str)
            .unwrap_or(self.key.as_str())
    }

    /// Primary state as text, when it is text.
    pub fn state_str(&self) -> Option<&str> {
        self.state.as_str()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
