//! Hub notifications (`persistent_notification`) surfaced as toasts.

use serde::Serialize;

use prism_core::{AttributeValue, DEFAULT_NOTIFICATION_TITLE};

use crate::protocol::{ServiceCallEvent, StateChange};

const NOTIFICATION_DOMAIN: &str = "persistent_notification";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubNotification {
    pub title: String,
    pub message: String,
    pub notification_id: Option<String>,
}

impl HubNotification {
    fn build(title: Option<&str>, message: Option<&str>, notification_id: Option<String>) -> Option<Self> {
        let message = message.map(str::trim).filter(|m| !m.is_empty())?;
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_NOTIFICATION_TITLE);

        Some(Self {
            title: title.to_string(),
            message: message.to_string(),
            notification_id,
        })
    }

    /// A `persistent_notification.*` entity appearing or changing.
    pub fn from_state_change(change: &StateChange) -> Option<Self> {
        if change.key.domain() != NOTIFICATION_DOMAIN {
            return None;
        }
        let entity = change.new_state.as_ref()?;

        let message = entity
            .attributes
            .get("message")
            .and_then(AttributeValue::as_str)
            .or_else(|| entity.state_str());
        let title = entity.attributes.get("title").and_then(AttributeValue::as_str);

        Self::build(title, message, Some(change.key.object_id().to_string()))
    }

    /// Someone called `persistent_notification.create`.
    pub fn from_service_call(call: &ServiceCallEvent) -> Option<Self> {
        if call.domain != NOTIFICATION_DOMAIN || call.service != "create" {
            return None;
        }
        let text = |field: &str| call.data.get(field).and_then(AttributeValue::as_str);

        Self::build(
            text("title"),
            text("message"),
            text("notification_id").map(str::to_string),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prism_core::Entity;
    use std::collections::BTreeMap;

    fn change(key: &str, entity: Option<Entity>) -> StateChange {
        StateChange {
            key: key.parse().unwrap(),
            new_state: entity,
            fired_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_state_change() {
        let entity = Entity::new("persistent_notification.backup".parse().unwrap(), "notifying", Utc::now())
            .with_attribute("title", "Backup")
            .with_attribute("message", "Backup finished");
        let n = HubNotification::from_state_change(&change("persistent_notification.backup", Some(entity))).unwrap();

        assert_eq!(n.title, "Backup");
        assert_eq!(n.message, "Backup finished");
        assert_eq!(n.notification_id.as_deref(), Some("backup"));
    }

    #[test]
    fn test_state_is_fallback_message_and_title_defaults() {
        let entity = Entity::new("persistent_notification.x".parse().unwrap(), "Door left open", Utc::now());
        let n = HubNotification::from_state_change(&change("persistent_notification.x", Some(entity))).unwrap();
        assert_eq!(n.title, "Home Assistant");
        assert_eq!(n.message, "Door left open");
    }

    #[test]
    fn test_ignored_changes() {
        let light = Entity::new("light.a".parse().unwrap(), "on", Utc::now());
        assert!(HubNotification::from_state_change(&change("light.a", Some(light))).is_none());
        assert!(HubNotification::from_state_change(&change("persistent_notification.x", None)).is_none());

        let blank = Entity::new("persistent_notification.x".parse().unwrap(), "  ", Utc::now());
        assert!(HubNotification::from_state_change(&change("persistent_notification.x", Some(blank))).is_none());
    }

    #[test]
    fn test_from_service_call() {
        let mut data = BTreeMap::new();
        data.insert("message".to_string(), AttributeValue::from("Update available"));
        data.insert("notification_id".to_string(), AttributeValue::from("update"));
        let call = ServiceCallEvent {
            domain: "persistent_notification".into(),
            service: "create".into(),
            data,
            fired_at: Utc::now(),
        };

        let n = HubNotification::from_service_call(&call).unwrap();
        assert_eq!(n.title, "Home Assistant");
        assert_eq!(n.notification_id.as_deref(), Some("update"));

        let dismiss = ServiceCallEvent {
            service: "dismiss".into(),
            ..call
        };
        assert!(HubNotification::from_service_call(&dismiss).is_none());
    }
}
