//! Terminal formatting for entities and change notifications.

use prism_core::{AttributeValue, Entity};
use prism_sync::{ChangeNotification, ChangeOrigin};

/// One line per entity: key, state, friendly name.
pub fn entity_line(entity: &Entity) -> String {
    let name = entity.friendly_name();
    if name == entity.key.as_str() {
        format!("{:<40} {}", entity.key, entity.state)
    } else {
        format!("{:<40} {:<16} {}", entity.key, entity.state.to_string(), name)
    }
}

fn origin_tag(origin: ChangeOrigin) -> &'static str {
    match origin {
        ChangeOrigin::Snapshot => "snapshot",
        ChangeOrigin::Event => "event",
        ChangeOrigin::Optimistic => "optimistic",
        ChangeOrigin::Rollback => "rollback",
    }
}

fn state_or_dash(entity: Option<&Entity>) -> String {
    entity.map_or_else(|| "-".to_string(), |e| e.state.to_string())
}

pub fn change_line(change: &ChangeNotification) -> String {
    format!(
        "#{:<6} [{:<10}] {} {} -> {}",
        change.sequence,
        origin_tag(change.origin),
        change.key,
        state_or_dash(change.previous.as_ref()),
        state_or_dash(change.current.as_ref()),
    )
}

/// Parses a command-line value as JSON, falling back to a plain string.
///
/// `on` stays text, `42` becomes an integer, `[255, 0, 0]` a list.
pub fn parse_value(raw: &str) -> AttributeValue {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => AttributeValue::from(value),
        Err(_) => AttributeValue::from(raw),
    }
}
