//! # Command Dispatcher
//!
//! Optimistic updates and their rollback, keyed by `(entity, attribute)`.
//!
//! ## Slot Lifecycle
//! ```text
//!                 begin()                     resolve(ok)
//!   (empty) ──────────────────► Pending ────────────────────► (empty)
//!      ▲                         │  │  │
//!      │        begin() again    │  │  │ resolve(error) / expire()
//!      │   (old caller gets      │  │  │ / fail_all()
//!      │    Superseded, its      │  │  └──────► rollback ───► (empty)
//!      │    rollback value is    │  │
//!      │    discarded)       ◄───┘  │ confirm_entity()
//!      │                            ▼ (authoritative event)
//!      └──────────────────────── Committed ── any outcome ──► (empty)
//! ```
//!
//! The dispatcher lives inside the engine worker, so every transition runs
//! on the same path that applies inbound events. At most one command is
//! pending per slot. A command's rollback value is always what the store
//! held just before its own optimistic write.
//!
//! Ids of commands that stop waiting without a result (superseded, timed
//! out) are kept until [`CommandDispatcher::take_retired`] collects them.
//! The engine drops them from its request ledger.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use prism_core::{Attribute, AttributeValue, EntityKey};

use crate::error::{CommandError, SyncError, SyncResult};
use crate::protocol::{HubFault, MessageId};
use crate::store::{ChangeOrigin, EntityStore};

type SlotKey = (EntityKey, Attribute);
type ReplySender = oneshot::Sender<Result<(), CommandError>>;

// =============================================================================
// Command Handle
// =============================================================================

/// Returned to whoever issued a command. Resolves exactly once.
#[derive(Debug)]
pub struct CommandHandle {
    correlation_id: MessageId,
    rx: oneshot::Receiver<Result<(), CommandError>>,
}

impl CommandHandle {
    pub(crate) fn new(correlation_id: MessageId) -> (Self, ReplySender) {
        let (tx, rx) = oneshot::channel();
        (Self { correlation_id, rx }, tx)
    }

    /// Id of the request on the connection it was sent over.
    pub fn correlation_id(&self) -> MessageId {
        self.correlation_id
    }

    /// Waits for the hub's verdict.
    ///
    /// If the engine goes away without answering, the command counts as
    /// cancelled.
    pub async fn outcome(self) -> Result<(), CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::Cancelled))
    }
}

// =============================================================================
// Pending State
// =============================================================================

/// The value to restore if the command fails.
#[derive(Debug, Clone, PartialEq)]
enum Rollback {
    /// `None` means the attribute was absent.
    Pending(Option<AttributeValue>),
    /// An authoritative event arrived; nothing to restore.
    Committed,
}

#[derive(Debug)]
struct PendingCommand {
    correlation_id: MessageId,
    requested: AttributeValue,
    rollback: Rollback,
    issued_at: Instant,
    deadline: Instant,
    reply: ReplySender,
}

#[derive(Debug)]
enum InFlight {
    Slot(SlotKey),
    /// A plain service call with no optimistic write.
    Detached { reply: ReplySender, deadline: Instant },
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug)]
pub struct CommandDispatcher {
    timeout: Duration,
    slots: HashMap<SlotKey, PendingCommand>,
    in_flight: HashMap<MessageId, InFlight>,
    retired: Vec<MessageId>,
}

impl CommandDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            slots: HashMap::new(),
            in_flight: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Commands waiting for a result, with or without a slot.
    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_pending(&self, key: &EntityKey, attribute: &Attribute) -> bool {
        self.slots.contains_key(&(key.clone(), attribute.clone()))
    }

    /// Registers a command with an optimistic write and applies the write.
    ///
    /// Any command already pending on the same slot is resolved with
    /// [`CommandError::Superseded`] and its result will be ignored. Its
    /// rollback value is dropped; the new command rolls back to the value
    /// it replaced.
    pub fn begin(
        &mut self,
        store: &EntityStore,
        correlation_id: MessageId,
        key: EntityKey,
        attribute: Attribute,
        value: AttributeValue,
        now: Instant,
    ) -> SyncResult<CommandHandle> {
        if !store.contains(key.as_str()) {
            return Err(SyncError::UnknownEntity(key.to_string()));
        }

        let slot = (key, attribute);
        self.supersede(&slot);

        let previous = store
            .write_attribute(&slot.0, &slot.1, Some(value.clone()), ChangeOrigin::Optimistic)
            .ok_or_else(|| SyncError::UnknownEntity(slot.0.to_string()))?;
        let rollback = Rollback::Pending(previous);

        let (handle, reply) = CommandHandle::new(correlation_id);
        debug!(
            correlation_id,
            entity = %slot.0,
            attribute = %slot.1,
            value = %value,
            "Command pending"
        );

        self.in_flight.insert(correlation_id, InFlight::Slot(slot.clone()));
        self.slots.insert(
            slot,
            PendingCommand {
                correlation_id,
                requested: value,
                rollback,
                issued_at: now,
                deadline: now + self.timeout,
                reply,
            },
        );
        Ok(handle)
    }

    /// Registers a command that touches no local state.
    pub fn begin_detached(&mut self, correlation_id: MessageId, now: Instant) -> CommandHandle {
        let (handle, reply) = CommandHandle::new(correlation_id);
        self.in_flight.insert(
            correlation_id,
            InFlight::Detached {
                reply,
                deadline: now + self.timeout,
            },
        );
        handle
    }

    /// Applies a command result. Returns `false` for ids this dispatcher no
    /// longer knows, which leaves the store untouched.
    pub fn resolve(
        &mut self,
        correlation_id: MessageId,
        outcome: Result<(), HubFault>,
        store: &EntityStore,
    ) -> bool {
        let outcome = outcome.map_err(|fault| CommandError::Rejected {
            code: fault.code,
            message: fault.message,
        });

        match self.in_flight.remove(&correlation_id) {
            Some(InFlight::Slot(slot)) => {
                let Some(pending) = self.slots.remove(&slot) else {
                    return false;
                };
                match &outcome {
                    Ok(()) => debug!(
                        correlation_id,
                        entity = %slot.0,
                        elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                        "Command confirmed"
                    ),
                    Err(err) => warn!(correlation_id, entity = %slot.0, error = %err, "Command rejected"),
                }
                self.finish(slot, pending, outcome, store);
                true
            }
            Some(InFlight::Detached { reply, .. }) => {
                let _ = reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// An authoritative event arrived for `key`: pending commands on it
    /// keep waiting for their result but will no longer roll back.
    pub fn confirm_entity(&mut self, key: &EntityKey) -> usize {
        let mut committed = 0;
        for ((entity, _), pending) in self.slots.iter_mut() {
            if entity == key && pending.rollback != Rollback::Committed {
                pending.rollback = Rollback::Committed;
                committed += 1;
            }
        }
        committed
    }

    /// Fails every command whose deadline has passed.
    pub fn expire(&mut self, now: Instant, store: &EntityStore) -> usize {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| self.deadline_of(flight).is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();

        let after_ms = self.timeout.as_millis() as u64;
        for id in &expired {
            warn!(correlation_id = *id, after_ms, "Command timed out");
            self.fail(*id, CommandError::TimedOut { after_ms }, store);
        }
        self.retired.extend_from_slice(&expired);
        expired.len()
    }

    /// Ids that stopped waiting without a result since the last call.
    pub fn take_retired(&mut self) -> Vec<MessageId> {
        std::mem::take(&mut self.retired)
    }

    /// Fails everything in flight, rolling back optimistic writes.
    pub fn fail_all(&mut self, error: CommandError, store: &EntityStore) -> usize {
        let ids: Vec<MessageId> = self.in_flight.keys().copied().collect();
        for id in &ids {
            self.fail(*id, error.clone(), store);
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), error = %error, "Failed pending commands");
        }
        self.retired.clear();
        ids.len()
    }

    fn supersede(&mut self, slot: &SlotKey) {
        let Some(old) = self.slots.remove(slot) else {
            return;
        };
        self.in_flight.remove(&old.correlation_id);
        self.retired.push(old.correlation_id);
        debug!(
            correlation_id = old.correlation_id,
            entity = %slot.0,
            attribute = %slot.1,
            "Command superseded"
        );
        let _ = old.reply.send(Err(CommandError::Superseded));
    }

    fn fail(&mut self, correlation_id: MessageId, error: CommandError, store: &EntityStore) {
        match self.in_flight.remove(&correlation_id) {
            Some(InFlight::Slot(slot)) => {
                if let Some(pending) = self.slots.remove(&slot) {
                    self.finish(slot, pending, Err(error), store);
                }
            }
            Some(InFlight::Detached { reply, .. }) => {
                let _ = reply.send(Err(error));
            }
            None => {}
        }
    }

    fn finish(
        &self,
        slot: SlotKey,
        pending: PendingCommand,
        outcome: Result<(), CommandError>,
        store: &EntityStore,
    ) {
        if outcome.is_err() {
            if let Rollback::Pending(previous) = pending.rollback {
                debug!(
                    entity = %slot.0,
                    attribute = %slot.1,
                    discarded = %pending.requested,
                    "Rolling back optimistic write"
                );
                store.write_attribute(&slot.0, &slot.1, previous, ChangeOrigin::Rollback);
            }
        }
        let _ = pending.reply.send(outcome);
    }

    fn deadline_of(&self, flight: &InFlight) -> Option<Instant> {
        match flight {
            InFlight::Slot(slot) => self.slots.get(slot).map(|p| p.deadline),
            InFlight::Detached { deadline, .. } => Some(*deadline),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prism_core::Entity;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn key(s: &str) -> EntityKey {
        s.parse().unwrap()
    }

    fn store_with(k: &str, state: &str) -> EntityStore {
        let store = EntityStore::new();
        store.apply_snapshot(vec![Entity::new(key(k), state, Utc::now())]);
        store
    }

    fn state_of(store: &EntityStore, k: &str) -> AttributeValue {
        store.get(k).unwrap().state
    }

    fn fault() -> HubFault {
        HubFault {
            code: "home_assistant_error".into(),
            message: "Failed".into(),
        }
    }

    #[tokio::test]
    async fn test_confirmed_command_keeps_optimistic_value() {
        let store = store_with("light.kitchen", "off");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);

        let handle = dispatcher
            .begin(&store, 1, key("light.kitchen"), Attribute::State, "on".into(), Instant::now())
            .unwrap();
        assert_eq!(state_of(&store, "light.kitchen"), AttributeValue::from("on"));

        assert!(dispatcher.resolve(1, Ok(()), &store));
        assert_eq!(handle.outcome().await, Ok(()));
        assert_eq!(state_of(&store, "light.kitchen"), AttributeValue::from("on"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_command_rolls_back() {
        let store = store_with("light.kitchen", "off");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);

        let handle = dispatcher
            .begin(&store, 1, key("light.kitchen"), Attribute::State, "on".into(), Instant::now())
            .unwrap();
        dispatcher.resolve(1, Err(fault()), &store);

        assert!(matches!(handle.outcome().await, Err(CommandError::Rejected { .. })));
        assert_eq!(state_of(&store, "light.kitchen"), AttributeValue::from("off"));
    }

    #[tokio::test]
    async fn test_unmatched_result_changes_nothing() {
        let store = store_with("light.kitchen", "off");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let _handle = dispatcher
            .begin(&store, 1, key("light.kitchen"), Attribute::State, "on".into(), Instant::now())
            .unwrap();

        let before = store.snapshot();
        assert!(!dispatcher.resolve(42, Err(fault()), &store));
        assert_eq!(*store.snapshot(), *before);
        assert!(dispatcher.is_pending(&key("light.kitchen"), &Attribute::State));
    }

    #[tokio::test]
    async fn test_supersede_rolls_back_to_replaced_value() {
        let store = store_with("media_player.tv", "idle");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let now = Instant::now();

        let first = dispatcher
            .begin(&store, 1, key("media_player.tv"), Attribute::State, "playing".into(), now)
            .unwrap();
        let second = dispatcher
            .begin(&store, 2, key("media_player.tv"), Attribute::State, "paused".into(), now)
            .unwrap();

        assert_eq!(first.outcome().await, Err(CommandError::Superseded));

        // The first command's late result is ignored.
        assert!(!dispatcher.resolve(1, Err(fault()), &store));
        assert_eq!(state_of(&store, "media_player.tv"), AttributeValue::from("paused"));

        dispatcher.resolve(2, Err(fault()), &store);
        assert!(second.outcome().await.is_err());
        assert_eq!(state_of(&store, "media_player.tv"), AttributeValue::from("playing"));
        assert_eq!(dispatcher.take_retired(), vec![1]);
    }

    #[tokio::test]
    async fn test_supersede_after_commit_rolls_back_to_hub_value() {
        let store = store_with("media_player.tv", "idle");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let now = Instant::now();

        let _first = dispatcher
            .begin(&store, 1, key("media_player.tv"), Attribute::State, "playing".into(), now)
            .unwrap();
        dispatcher.confirm_entity(&key("media_player.tv"));
        let _second = dispatcher
            .begin(&store, 2, key("media_player.tv"), Attribute::State, "paused".into(), now)
            .unwrap();

        dispatcher.resolve(2, Err(fault()), &store);
        assert_eq!(state_of(&store, "media_player.tv"), AttributeValue::from("playing"));
    }

    #[tokio::test]
    async fn test_different_attributes_do_not_conflict() {
        let store = store_with("light.kitchen", "off");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let now = Instant::now();

        dispatcher
            .begin(&store, 1, key("light.kitchen"), Attribute::State, "on".into(), now)
            .unwrap();
        dispatcher
            .begin(&store, 2, key("light.kitchen"), Attribute::named("brightness"), 200.into(), now)
            .unwrap();
        assert_eq!(dispatcher.pending_count(), 2);

        dispatcher.resolve(2, Err(fault()), &store);
        let entity = store.get("light.kitchen").unwrap();
        assert_eq!(entity.state, AttributeValue::from("on"));
        assert!(entity.attributes.get("brightness").is_none());
    }

    #[tokio::test]
    async fn test_committed_command_does_not_roll_back() {
        let store = store_with("switch.fan", "off");
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);

        let handle = dispatcher
            .begin(&store, 1, key("switch.fan"), Attribute::State, "on".into(), Instant::now())
            .unwrap();
        assert_eq!(dispatcher.confirm_entity(&key("switch.fan")), 1);

        dispatcher.resolve(1, Err(fault()), &store);
        assert!(handle.outcome().await.is_err());
        assert_eq!(state_of(&store, "switch.fan"), AttributeValue::from("on"));
    }

    #[tokio::test]
    async fn test_expire_and_fail_all() {
        let store = store_with("light.kitchen", "off");
        let mut dispatcher = CommandDispatcher::new(Duration::from_millis(100));
        let start = Instant::now();

        let timed = dispatcher
            .begin(&store, 1, key("light.kitchen"), Attribute::State, "on".into(), start)
            .unwrap();
        let plain = dispatcher.begin_detached(2, start + Duration::from_millis(80));

        assert_eq!(dispatcher.expire(start + Duration::from_millis(50), &store), 0);
        assert_eq!(dispatcher.expire(start + Duration::from_millis(100), &store), 1);
        assert_eq!(timed.outcome().await, Err(CommandError::TimedOut { after_ms: 100 }));
        assert_eq!(state_of(&store, "light.kitchen"), AttributeValue::from("off"));
        assert_eq!(dispatcher.take_retired(), vec![1]);
        assert!(dispatcher.take_retired().is_empty());

        assert_eq!(dispatcher.fail_all(CommandError::ConnectionLost, &store), 1);
        assert_eq!(plain.outcome().await, Err(CommandError::ConnectionLost));
    }

    #[test]
    fn test_unknown_entity_is_refused() {
        let store = EntityStore::new();
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let err = dispatcher
            .begin(&store, 1, key("light.ghost"), Attribute::State, "on".into(), Instant::now())
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownEntity(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_dispatcher_cancels_handles() {
        let mut dispatcher = CommandDispatcher::new(TIMEOUT);
        let handle = dispatcher.begin_detached(1, Instant::now());
        drop(dispatcher);
        assert_eq!(handle.outcome().await, Err(CommandError::Cancelled));
    }
}
