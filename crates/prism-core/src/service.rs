//! # Service Calls
//!
//! The hub never accepts "set attribute X to Y" directly; every write is a
//! service call such as `light.turn_on { brightness: 128 }`. This module owns
//! the mapping from an attribute write to the call that produces it.
//!
//! ## Resolution
//! ```text
//!   (light.kitchen, state, "on")            ──► light.turn_on
//!   (lock.front_door, state, "unlocked")    ──► lock.unlock
//!   (light.kitchen, brightness, 128)        ──► light.turn_on { brightness: 128 }
//!   (media_player.tv, volume_level, 0.4)    ──► media_player.volume_set { volume_level: 0.4 }
//!   (vacuum.robot, state, "on")             ──► homeassistant.turn_on
//!   (sensor.outdoor, state, "12")           ──► UnsupportedCommand
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Attribute, EntityKey};
use crate::validation::{validate_domain, validate_service_name};
use crate::value::AttributeValue;
use crate::DEFAULT_SERVICE_DOMAIN;

// =============================================================================
// Service Call
// =============================================================================

/// Entity targeted by a service call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub entity_id: EntityKey,
}

/// A hub service invocation, independent of the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default)]
    pub data: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub target: Option<ServiceTarget>,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        ServiceCall {
            domain: domain.into(),
            service: service.into(),
            data: BTreeMap::new(),
            target: None,
        }
    }

    /// Parses `"domain.service"`, or a bare `"service"` in the
    /// `homeassistant` domain.
    ///
    /// ```rust
    /// use prism_core::ServiceCall;
    ///
    /// let call = ServiceCall::parse("light.turn_on").unwrap();
    /// assert_eq!((call.domain.as_str(), call.service.as_str()), ("light", "turn_on"));
    ///
    /// let call = ServiceCall::parse("toggle").unwrap();
    /// assert_eq!(call.domain, "homeassistant");
    /// ```
    pub fn parse(spec: &str) -> Result<Self, CoreError> {
        let spec = spec.trim();
        let (domain, service) = spec
            .split_once('.')
            .unwrap_or((DEFAULT_SERVICE_DOMAIN, spec));

        validate_domain(domain)?;
        validate_service_name(service)?;
        Ok(ServiceCall::new(domain, service))
    }

    pub fn targeting(mut self, key: &EntityKey) -> Self {
        self.target = Some(ServiceTarget {
            entity_id: key.clone(),
        });
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn target_entity(&self) -> Option<&EntityKey> {
        self.target.as_ref().map(|t| &t.entity_id)
    }
}

impl fmt::Display for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.service)
    }
}

// =============================================================================
// Resolution Tables
// =============================================================================

/// Domains whose primary state is a plain on/off switch.
const ON_OFF_DOMAINS: &[&str] = &[
    "light",
    "switch",
    "fan",
    "input_boolean",
    "siren",
    "humidifier",
    "automation",
    "media_player",
];

/// Domains that only report; nothing can be written to them.
const READ_ONLY_DOMAINS: &[&str] = &[
    "sensor",
    "binary_sensor",
    "sun",
    "weather",
    "person",
    "zone",
    "device_tracker",
    "persistent_notification",
    "event",
];

struct NamedSetter {
    domain: &'static str,
    attribute: &'static str,
    service: &'static str,
    data_key: &'static str,
}

const fn setter(
    domain: &'static str,
    attribute: &'static str,
    service: &'static str,
    data_key: &'static str,
) -> NamedSetter {
    NamedSetter {
        domain,
        attribute,
        service,
        data_key,
    }
}

const NAMED_SETTERS: &[NamedSetter] = &[
    setter("light", "brightness", "turn_on", "brightness"),
    setter("light", "brightness_pct", "turn_on", "brightness_pct"),
    setter("light", "color_temp", "turn_on", "color_temp"),
    setter("light", "color_temp_kelvin", "turn_on", "color_temp_kelvin"),
    setter("light", "rgb_color", "turn_on", "rgb_color"),
    setter("light", "hs_color", "turn_on", "hs_color"),
    setter("light", "effect", "turn_on", "effect"),
    setter("media_player", "volume_level", "volume_set", "volume_level"),
    setter("media_player", "is_volume_muted", "volume_mute", "is_volume_muted"),
    setter("media_player", "source", "select_source", "source"),
    setter("climate", "temperature", "set_temperature", "temperature"),
    setter("climate", "fan_mode", "set_fan_mode", "fan_mode"),
    setter("climate", "preset_mode", "set_preset_mode", "preset_mode"),
    setter("cover", "current_position", "set_cover_position", "position"),
    setter("fan", "percentage", "set_percentage", "percentage"),
];

// =============================================================================
// Resolution
// =============================================================================

/// Maps an attribute write onto the hub service that performs it.
///
/// The returned call always targets `key`.
pub fn resolve_command(
    key: &EntityKey,
    attribute: &Attribute,
    value: &AttributeValue,
) -> Result<ServiceCall, CoreError> {
    let resolved = match attribute {
        Attribute::State => resolve_state(key, value),
        Attribute::Named(name) => resolve_named(key, name, value),
    };

    resolved.ok_or_else(|| CoreError::UnsupportedCommand {
        entity: key.to_string(),
        attribute: attribute.to_string(),
        value: value.to_string(),
    })
}

fn on_off(value: &AttributeValue) -> Option<bool> {
    match value {
        AttributeValue::Bool(b) => Some(*b),
        AttributeValue::Text(s) if s == "on" => Some(true),
        AttributeValue::Text(s) if s == "off" => Some(false),
        _ => None,
    }
}

fn switch_service(on: bool) -> &'static str {
    if on {
        "turn_on"
    } else {
        "turn_off"
    }
}

fn resolve_state(key: &EntityKey, value: &AttributeValue) -> Option<ServiceCall> {
    let domain = key.domain();
    let text = value.as_str();
    let call = |service: &str| ServiceCall::new(domain, service).targeting(key);

    if READ_ONLY_DOMAINS.contains(&domain) {
        return None;
    }

    match domain {
        "lock" => match text? {
            "locked" => Some(call("lock")),
            "unlocked" => Some(call("unlock")),
            _ => None,
        },
        "cover" => match text? {
            "open" => Some(call("open_cover")),
            "closed" => Some(call("close_cover")),
            _ => None,
        },
        "input_number" | "number" if value.is_number() => {
            Some(call("set_value").with_data("value", value.clone()))
        }
        "input_select" | "select" => Some(call("select_option").with_data("option", text?)),
        "input_text" | "text" => Some(call("set_value").with_data("value", text?)),
        "climate" => Some(call("set_hvac_mode").with_data("hvac_mode", text?)),
        "media_player" => match text {
            Some("playing") => Some(call("media_play")),
            Some("paused") => Some(call("media_pause")),
            Some("idle") => Some(call("media_stop")),
            _ => on_off(value).map(|on| call(switch_service(on))),
        },
        d if ON_OFF_DOMAINS.contains(&d) => on_off(value).map(|on| call(switch_service(on))),
        _ => on_off(value).map(|on| {
            ServiceCall::new(DEFAULT_SERVICE_DOMAIN, switch_service(on)).targeting(key)
        }),
    }
}

fn resolve_named(key: &EntityKey, name: &str, value: &AttributeValue) -> Option<ServiceCall> {
    if value.is_null() {
        return None;
    }

    NAMED_SETTERS
        .iter()
        .find(|s| s.domain == key.domain() && s.attribute == name)
        .map(|s| {
            ServiceCall::new(s.domain, s.service)
                .targeting(key)
                .with_data(s.data_key, value.clone())
        })
}

// =============================================================================
// Unit Tests
// =============================================================================
