//! # Subscriptions
//!
//! Tracks which event types the engine wants and which subscription ids the
//! hub has acknowledged on the current connection.
//!
//! The requested set is fixed for the engine's lifetime. Active ids are
//! cleared on disconnect and rebound on every reconnect, so resubscribing
//! never leaves two live ids for the same event type.

use std::collections::{BTreeMap, BTreeSet};

use prism_core::EntityKey;

use crate::protocol::MessageId;

// =============================================================================
// Subscription Set
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    requested: Vec<String>,
    active: BTreeMap<MessageId, String>,
}

impl SubscriptionSet {
    /// Duplicates are dropped; first occurrence keeps its position.
    pub fn new<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut requested: Vec<String> = Vec::new();
        for event_type in event_types {
            let event_type = event_type.into();
            if !requested.contains(&event_type) {
                requested.push(event_type);
            }
        }
        Self {
            requested,
            active: BTreeMap::new(),
        }
    }

    /// Event types to subscribe to, in request order.
    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    /// Records a hub acknowledgement. A previous id for the same event type
    /// is released.
    pub fn bind(&mut self, subscription_id: MessageId, event_type: &str) {
        self.active.retain(|_, existing| existing != event_type);
        self.active.insert(subscription_id, event_type.to_string());
    }

    /// Forgets all active ids. Called when the connection drops.
    pub fn reset(&mut self) {
        self.active.clear();
    }

    pub fn is_active(&self, subscription_id: MessageId) -> bool {
        self.active.contains_key(&subscription_id)
    }

    pub fn event_type(&self, subscription_id: MessageId) -> Option<&str> {
        self.active.get(&subscription_id).map(String::as_str)
    }

    /// True once every requested event type has a live id.
    pub fn is_complete(&self) -> bool {
        self.requested
            .iter()
            .all(|wanted| self.active.values().any(|bound| bound == wanted))
    }

    /// `(subscription_id, event_type)` pairs, ordered by id.
    pub fn active(&self) -> Vec<(MessageId, String)> {
        self.active
            .iter()
            .map(|(id, event_type)| (*id, event_type.clone()))
            .collect()
    }
}

// =============================================================================
// Entity Filter
// =============================================================================

/// Limits which entities are mirrored. Patterns are either an exact key
/// (`light.kitchen`) or a whole domain (`light`). Empty allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    keys: BTreeSet<String>,
    domains: BTreeSet<String>,
}

impl EntityFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains('.') {
                filter.keys.insert(pattern.to_string());
            } else {
                filter.domains.insert(pattern.to_string());
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.domains.is_empty()
    }

    pub fn allows(&self, key: &EntityKey) -> bool {
        self.is_empty() || self.keys.contains(key.as_str()) || self.domains.contains(key.domain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> EntityKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_requested_dedup_keeps_order() {
        let set = SubscriptionSet::new(["state_changed", "call_service", "state_changed"]);
        assert_eq!(set.requested(), ["state_changed", "call_service"]);
    }

    #[test]
    fn test_bind_and_reset() {
        let mut set = SubscriptionSet::new(["state_changed", "call_service"]);
        assert!(!set.is_complete());

        set.bind(1, "state_changed");
        set.bind(2, "call_service");
        assert!(set.is_complete());
        assert_eq!(set.event_type(2), Some("call_service"));

        set.reset();
        assert!(!set.is_active(1));
        assert!(!set.is_complete());
        assert_eq!(set.requested().len(), 2);
    }

    #[test]
    fn test_rebind_releases_old_id() {
        let mut set = SubscriptionSet::new(["state_changed"]);
        set.bind(1, "state_changed");
        set.bind(7, "state_changed");

        assert!(!set.is_active(1));
        assert_eq!(set.active(), vec![(7, "state_changed".to_string())]);
    }

    #[test]
    fn test_entity_filter() {
        let filter = EntityFilter::new(["light", "switch.porch", " "]);
        assert!(filter.allows(&key("light.kitchen")));
        assert!(filter.allows(&key("switch.porch")));
        assert!(!filter.allows(&key("switch.garage")));

        assert!(EntityFilter::default().allows(&key("sensor.anything")));
    }
}
