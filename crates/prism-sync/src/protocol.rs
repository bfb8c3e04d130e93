//! # Hub Protocol Messages
//!
//! Codec for the Home Assistant WebSocket API.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Hub Protocol Messages                              │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  HUB    ───► auth_required { ha_version }                              │
//! │  CLIENT ───► auth { access_token }                                     │
//! │  HUB    ───► auth_ok | auth_invalid { message }                        │
//! │                                                                         │
//! │  SUBSCRIBE & SNAPSHOT                                                  │
//! │  ────────────────────                                                  │
//! │  CLIENT ───► subscribe_events { id, event_type }                       │
//! │  HUB    ───► result { id, success }                                    │
//! │  CLIENT ───► get_states { id }                                         │
//! │  HUB    ───► result { id, success, result: [state, ...] }              │
//! │                                                                         │
//! │  EVENTS (id = subscription id)                                         │
//! │  ─────────────────────────────                                         │
//! │  HUB    ───► event { id, event: { event_type, data, time_fired } }     │
//! │                                                                         │
//! │  COMMANDS (id = correlation id)                                        │
//! │  ──────────────────────────────                                        │
//! │  CLIENT ───► call_service { id, domain, service, service_data, target }│
//! │  HUB    ───► result { id, success, error?: { code, message } }         │
//! │                                                                         │
//! │  KEEPALIVE: WebSocket ping/pong control frames (see transport)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every frame is a JSON text frame tagged by `"type"`. Inbound frames that
//! don't parse become a [`DecodeError`]; the caller logs and drops them.
//!
//! Timestamps encode as RFC 3339 UTC with microsecond precision, floats
//! with shortest round-trip formatting, so decode ∘ encode is the identity
//! on entities.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use prism_core::{AttributeValue, Entity, EntityKey, ServiceCall, ServiceTarget};

use crate::config::AccessToken;
use crate::error::{DecodeError, SyncResult};

/// Per-connection request id. Subscription ids and command correlation ids
/// are both message ids.
pub type MessageId = u64;

/// Inbound `type` values this codec understands.
const KNOWN_TYPES: &[&str] = &[
    "auth_required",
    "auth_ok",
    "auth_invalid",
    "result",
    "event",
];

// =============================================================================
// Outbound Messages
// =============================================================================

/// Frames the engine sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        access_token: AccessToken,
    },
    SubscribeEvents {
        id: MessageId,
        event_type: String,
    },
    GetStates {
        id: MessageId,
    },
    CallService {
        id: MessageId,
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        service_data: BTreeMap<String, AttributeValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<ServiceTarget>,
    },
}

impl ClientMessage {
    pub fn call_service(id: MessageId, call: ServiceCall) -> Self {
        ClientMessage::CallService {
            id,
            domain: call.domain,
            service: call.service,
            service_data: call.data,
            target: call.target,
        }
    }

    /// Message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::SubscribeEvents { .. } => "subscribe_events",
            ClientMessage::GetStates { .. } => "get_states",
            ClientMessage::CallService { .. } => "call_service",
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        match self {
            ClientMessage::Auth { .. } => None,
            ClientMessage::SubscribeEvents { id, .. }
            | ClientMessage::GetStates { id }
            | ClientMessage::CallService { id, .. } => Some(*id),
        }
    }

    /// Serializes to a text frame.
    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Inbound Messages
// =============================================================================

/// Outcome of the authentication step.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    Accepted { hub_version: Option<String> },
    Rejected { message: String },
}

/// Error body of a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFault {
    pub code: String,
    pub message: String,
}

/// A `result` frame, not yet matched to the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFrame {
    pub id: MessageId,
    pub outcome: Result<Value, HubFault>,
}

/// An authoritative state change pushed by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: EntityKey,
    /// `None` when the entity was removed from the hub.
    pub new_state: Option<Entity>,
    pub fired_at: DateTime<Utc>,
}

/// Someone (possibly another client) invoked a service on the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCallEvent {
    pub domain: String,
    pub service: String,
    pub data: BTreeMap<String, AttributeValue>,
    pub fired_at: DateTime<Utc>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    AuthChallenge {
        hub_version: Option<String>,
    },
    AuthResult(AuthOutcome),
    Result(ResultFrame),
    StateChanged {
        subscription_id: MessageId,
        change: StateChange,
    },
    ServiceCalled {
        subscription_id: MessageId,
        call: ServiceCallEvent,
    },
    /// Any other subscribed event type, passed through undecoded.
    Event {
        subscription_id: MessageId,
        event_type: String,
        data: Value,
    },
}

impl HubMessage {
    /// Message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            HubMessage::AuthChallenge { .. } => "auth_required",
            HubMessage::AuthResult(AuthOutcome::Accepted { .. }) => "auth_ok",
            HubMessage::AuthResult(AuthOutcome::Rejected { .. }) => "auth_invalid",
            HubMessage::Result(_) => "result",
            HubMessage::StateChanged { .. } => "state_changed",
            HubMessage::ServiceCalled { .. } => "call_service",
            HubMessage::Event { .. } => "event",
        }
    }

    /// Subscription the event arrived on, for event frames.
    pub fn subscription_id(&self) -> Option<MessageId> {
        match self {
            HubMessage::StateChanged { subscription_id, .. }
            | HubMessage::ServiceCalled { subscription_id, .. }
            | HubMessage::Event { subscription_id, .. } => Some(*subscription_id),
            _ => None,
        }
    }
}

// =============================================================================
// Raw Wire Shapes
// =============================================================================

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result {
        id: MessageId,
        success: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<RawFault>,
    },
    Event {
        id: MessageId,
        event: RawEvent,
    },
}

#[derive(Deserialize)]
struct RawFault {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RawEvent {
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    time_fired: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawState {
    entity_id: String,
    state: Value,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    last_changed: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawStateChanged {
    entity_id: String,
    #[serde(default)]
    new_state: Option<RawState>,
}

#[derive(Deserialize)]
struct RawServiceCall {
    domain: String,
    service: String,
    #[serde(default)]
    service_data: BTreeMap<String, AttributeValue>,
}

impl RawState {
    fn into_entity(self, fallback: DateTime<Utc>) -> Result<Entity, DecodeError> {
        let key = EntityKey::new(self.entity_id).map_err(|e| DecodeError::invalid("entity_id", e))?;
        Ok(Entity {
            key,
            state: AttributeValue::from(self.state),
            attributes: self.attributes,
            last_updated: self.last_updated.or(self.last_changed).unwrap_or(fallback),
        })
    }
}

fn fault_code(code: Value) -> String {
    match code {
        Value::String(s) => s,
        Value::Null => "unknown_error".to_string(),
        other => other.to_string(),
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes one inbound text frame.
pub fn decode(frame: &str) -> Result<HubMessage, DecodeError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let type_name = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing \"type\" field".to_string()))?;

    if !KNOWN_TYPES.contains(&type_name) {
        return Err(DecodeError::UnknownType(type_name.to_string()));
    }

    let raw: RawFrame =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let message = match raw {
        RawFrame::AuthRequired { ha_version } => HubMessage::AuthChallenge {
            hub_version: ha_version,
        },
        RawFrame::AuthOk { ha_version } => HubMessage::AuthResult(AuthOutcome::Accepted {
            hub_version: ha_version,
        }),
        RawFrame::AuthInvalid { message } => HubMessage::AuthResult(AuthOutcome::Rejected {
            message: message.unwrap_or_else(|| "Invalid access token".to_string()),
        }),
        RawFrame::Result {
            id,
            success,
            result,
            error,
        } => {
            let outcome = if success {
                Ok(result)
            } else {
                let fault = error.unwrap_or(RawFault {
                    code: Value::Null,
                    message: String::new(),
                });
                Err(HubFault {
                    code: fault_code(fault.code),
                    message: fault.message,
                })
            };
            HubMessage::Result(ResultFrame { id, outcome })
        }
        RawFrame::Event { id, event } => decode_event(id, event)?,
    };

    Ok(message)
}

fn decode_event(subscription_id: MessageId, event: RawEvent) -> Result<HubMessage, DecodeError> {
    let fired_at = event.time_fired.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    match event.event_type.as_str() {
        "state_changed" => {
            let raw: RawStateChanged = serde_json::from_value(event.data)
                .map_err(|e| DecodeError::invalid("state_changed data", e))?;
            let key = EntityKey::new(raw.entity_id).map_err(|e| DecodeError::invalid("entity_id", e))?;
            let new_state = match raw.new_state {
                Some(state) => {
                    let entity = state.into_entity(fired_at)?;
                    if entity.key != key {
                        return Err(DecodeError::invalid(
                            "new_state",
                            format!("entity_id {} does not match {}", entity.key, key),
                        ));
                    }
                    Some(entity)
                }
                None => None,
            };
            Ok(HubMessage::StateChanged {
                subscription_id,
                change: StateChange {
                    key,
                    new_state,
                    fired_at,
                },
            })
        }
        "call_service" => {
            let raw: RawServiceCall = serde_json::from_value(event.data)
                .map_err(|e| DecodeError::invalid("call_service data", e))?;
            Ok(HubMessage::ServiceCalled {
                subscription_id,
                call: ServiceCallEvent {
                    domain: raw.domain,
                    service: raw.service,
                    data: raw.service_data,
                    fired_at,
                },
            })
        }
        _ => Ok(HubMessage::Event {
            subscription_id,
            event_type: event.event_type,
            data: event.data,
        }),
    }
}

/// Parses a `get_states` result into entities.
///
/// Entries with an invalid key are skipped and logged; a non-list result is
/// an error.
pub fn decode_snapshot(result: Value) -> Result<Vec<Entity>, DecodeError> {
    let items = match result {
        Value::Array(items) => items,
        other => {
            return Err(DecodeError::invalid(
                "get_states result",
                format!("expected a list, got {}", json_kind(&other)),
            ))
        }
    };

    let mut entities = Vec::with_capacity(items.len());
    for item in items {
        let parsed = serde_json::from_value::<RawState>(item)
            .map_err(|e| DecodeError::invalid("state", e))
            .and_then(|raw| raw.into_entity(DateTime::<Utc>::UNIX_EPOCH));
        match parsed {
            Ok(entity) => entities.push(entity),
            Err(err) => warn!(error = %err, "Skipping unreadable entity in snapshot"),
        }
    }
    Ok(entities)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Encoding Helpers
// =============================================================================

/// RFC 3339, UTC, microseconds.
pub fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Renders an entity in the hub's state-object shape.
pub fn encode_state(entity: &Entity) -> Value {
    let updated = encode_timestamp(&entity.last_updated);
    json!({
        "entity_id": entity.key,
        "state": entity.state,
        "attributes": entity.attributes,
        "last_changed": updated,
        "last_updated": updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(s: &str) -> EntityKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_client_message_serialization() {
        let auth = ClientMessage::Auth {
            access_token: AccessToken::new("abc"),
        };
        assert_eq!(auth.encode().unwrap(), r#"{"type":"auth","access_token":"abc"}"#);
        assert!(!format!("{:?}", auth).contains("abc"));

        let sub = ClientMessage::SubscribeEvents {
            id: 1,
            event_type: "state_changed".into(),
        };
        let v: Value = serde_json::from_str(&sub.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"id": 1, "type": "subscribe_events", "event_type": "state_changed"}));
    }

    #[test]
    fn test_call_service_serialization() {
        let call = ServiceCall::new("light", "turn_on")
            .targeting(&key("light.kitchen"))
            .with_data("brightness", 128);
        let msg = ClientMessage::call_service(7, call);

        assert_eq!(msg.id(), Some(7));
        let v: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "id": 7,
                "type": "call_service",
                "domain": "light",
                "service": "turn_on",
                "service_data": {"brightness": 128},
                "target": {"entity_id": "light.kitchen"}
            })
        );

        let bare = ClientMessage::call_service(8, ServiceCall::new("homeassistant", "restart"));
        let v: Value = serde_json::from_str(&bare.encode().unwrap()).unwrap();
        assert!(v.get("service_data").is_none());
        assert!(v.get("target").is_none());
    }

    #[test]
    fn test_decode_auth_frames() {
        assert_eq!(
            decode(r#"{"type":"auth_required","ha_version":"2024.6.0"}"#).unwrap(),
            HubMessage::AuthChallenge {
                hub_version: Some("2024.6.0".into())
            }
        );
        assert_eq!(
            decode(r#"{"type":"auth_invalid","message":"Invalid password"}"#).unwrap(),
            HubMessage::AuthResult(AuthOutcome::Rejected {
                message: "Invalid password".into()
            })
        );
        assert!(matches!(
            decode(r#"{"type":"auth_ok"}"#).unwrap(),
            HubMessage::AuthResult(AuthOutcome::Accepted { hub_version: None })
        ));
    }

    #[test]
    fn test_decode_result_frames() {
        let ok = decode(r#"{"id":3,"type":"result","success":true,"result":null}"#).unwrap();
        assert_eq!(
            ok,
            HubMessage::Result(ResultFrame {
                id: 3,
                outcome: Ok(Value::Null)
            })
        );

        let err = decode(
            r#"{"id":4,"type":"result","success":false,"error":{"code":"not_found","message":"Unable to find service light.explode"}}"#,
        )
        .unwrap();
        let HubMessage::Result(frame) = err else {
            panic!("expected result frame");
        };
        let fault = frame.outcome.unwrap_err();
        assert_eq!(fault.code, "not_found");
        assert!(fault.message.contains("light.explode"));
    }

    #[test]
    fn test_decode_state_changed() {
        let frame = r#"{
            "id": 1,
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {
                    "entity_id": "light.kitchen",
                    "old_state": null,
                    "new_state": {
                        "entity_id": "light.kitchen",
                        "state": "on",
                        "attributes": {"brightness": 255, "friendly_name": "Kitchen"},
                        "last_changed": "2024-05-01T10:00:00.123456+00:00",
                        "last_updated": "2024-05-01T10:00:00.123456+00:00"
                    }
                },
                "time_fired": "2024-05-01T10:00:00.123999+00:00"
            }
        }"#;

        let HubMessage::StateChanged {
            subscription_id,
            change,
        } = decode(frame).unwrap()
        else {
            panic!("expected state change");
        };
        assert_eq!(subscription_id, 1);
        assert_eq!(change.key, key("light.kitchen"));
        let entity = change.new_state.unwrap();
        assert_eq!(entity.state, AttributeValue::from("on"));
        assert_eq!(entity.attributes["brightness"], AttributeValue::Integer(255));
        assert_eq!(
            entity.last_updated,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::microseconds(123_456)
        );
    }

    #[test]
    fn test_decode_entity_removed() {
        let frame = r#"{"id":1,"type":"event","event":{"event_type":"state_changed","data":{"entity_id":"switch.old","new_state":null}}}"#;
        let HubMessage::StateChanged { change, .. } = decode(frame).unwrap() else {
            panic!("expected state change");
        };
        assert!(change.new_state.is_none());
    }

    #[test]
    fn test_decode_call_service_event() {
        let frame = r#"{"id":2,"type":"event","event":{"event_type":"call_service","data":{"domain":"persistent_notification","service":"create","service_data":{"title":"Door","message":"Front door open"}}}}"#;
        let HubMessage::ServiceCalled { call, .. } = decode(frame).unwrap() else {
            panic!("expected service call event");
        };
        assert_eq!(call.domain, "persistent_notification");
        assert_eq!(call.data["message"], AttributeValue::from("Front door open"));
    }

    #[test]
    fn test_decode_failures() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(r#"{"id":1}"#), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"zap"}"#),
            Err(DecodeError::UnknownType(t)) if t == "zap"
        ));
        // Keepalive lives in the transport; app-level pongs are not part of the codec.
        assert!(matches!(
            decode(r#"{"id":9,"type":"pong"}"#),
            Err(DecodeError::UnknownType(t)) if t == "pong"
        ));
        assert!(matches!(
            decode(r#"{"type":"result","success":true}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(decode(
            r#"{"id":1,"type":"event","event":{"event_type":"state_changed","data":{"entity_id":"Bad Key"}}}"#
        )
        .is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_is_lossless() {
        let updated = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::microseconds(678_901);
        let entity = Entity::new(key("climate.hall"), "heat", updated)
            .with_attribute("temperature", 21.3)
            .with_attribute("current_temperature", 0.1 + 0.2)
            .with_attribute("hvac_modes", AttributeValue::List(vec!["heat".into(), "off".into()]))
            .with_attribute("min_temp", 7);

        let encoded = encode_state(&entity);
        let text = serde_json::to_string(&json!([encoded])).unwrap();
        let decoded = decode_snapshot(serde_json::from_str(&text).unwrap()).unwrap();

        assert_eq!(decoded, vec![entity]);
    }

    #[test]
    fn test_snapshot_skips_bad_entries() {
        let result = json!([
            {"entity_id": "light.ok", "state": "on", "attributes": {}},
            {"entity_id": "NOT VALID", "state": "on"},
            {"state": "on"}
        ]);
        let entities = decode_snapshot(result).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].key, key("light.ok"));

        assert!(decode_snapshot(json!({"light.ok": "on"})).is_err());
    }

    #[test]
    fn test_encode_timestamp_precision() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::microseconds(5);
        assert_eq!(encode_timestamp(&at), "2024-05-01T10:00:00.000005Z");
    }
}
